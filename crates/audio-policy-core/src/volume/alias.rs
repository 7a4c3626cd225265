//! Stream aliasing and index rescaling

use crate::config::PlatformType;
use crate::types::{AppOp, StreamType};

use StreamType::*;

/// Rounded linear rescale of an index between two maximum-index domains
pub fn rescale(index: i32, src_max: i32, dst_max: i32) -> i32 {
    if src_max <= 0 {
        return 0;
    }
    let scaled = (i64::from(index) * i64::from(dst_max) + i64::from(src_max / 2)) / i64::from(src_max);
    scaled.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

const ALIAS_VOICE: [StreamType; StreamType::COUNT] = [
    VoiceCall,
    Ring,
    Ring,
    Music,
    Alarm,
    Ring,
    BluetoothSco,
    Ring,
    Ring,
    Music,
];

const ALIAS_TELEVISION: [StreamType; StreamType::COUNT] = [Music; StreamType::COUNT];

const ALIAS_DEFAULT: [StreamType; StreamType::COUNT] = [
    VoiceCall,
    Ring,
    Ring,
    Music,
    Alarm,
    Ring,
    BluetoothSco,
    Ring,
    Ring,
    Music,
];

/// Runtime inputs of alias resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasContext {
    pub platform: PlatformType,
    pub in_communication: bool,
    pub link_notification_with_ring: bool,
    pub voice_capable: bool,
}

/// Stream → alias mapping
///
/// Aliases never chain: the alias of an alias is itself, so a stream is
/// either an alias target or a leaf that mirrors one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasTable([StreamType; StreamType::COUNT]);

impl AliasTable {
    /// Static table of a platform, before runtime adjustments
    pub fn for_platform(platform: PlatformType) -> Self {
        match platform {
            PlatformType::Voice => Self(ALIAS_VOICE),
            PlatformType::Television => Self(ALIAS_TELEVISION),
            PlatformType::Default => Self(ALIAS_DEFAULT),
        }
    }

    /// Full table including the DTMF and notification adjustments
    pub fn resolve(ctx: AliasContext) -> Self {
        let mut table = Self::for_platform(ctx.platform);
        let dtmf = match ctx.platform {
            PlatformType::Voice if ctx.in_communication => VoiceCall,
            PlatformType::Voice => Ring,
            PlatformType::Television => Music,
            PlatformType::Default if ctx.in_communication => VoiceCall,
            PlatformType::Default => Music,
        };
        table.0[Dtmf.index()] = dtmf;
        if ctx.platform != PlatformType::Television {
            table.0[Notification.index()] = if ctx.link_notification_with_ring && ctx.voice_capable {
                Ring
            } else {
                Notification
            };
        }
        table
    }

    pub fn alias(&self, stream: StreamType) -> StreamType {
        self.0[stream.index()]
    }

    /// Streams other than `target` that mirror it
    pub fn dependents(&self, target: StreamType) -> impl Iterator<Item = StreamType> + '_ {
        StreamType::ALL
            .into_iter()
            .filter(move |s| *s != target && self.alias(*s) == target)
    }

    pub fn is_target(&self, stream: StreamType) -> bool {
        self.alias(stream) == stream
    }

    /// True when no alias points at a stream that is itself a leaf
    pub fn is_flat(&self) -> bool {
        StreamType::ALL
            .iter()
            .all(|s| self.alias(self.alias(*s)) == self.alias(*s))
    }
}

/// App op that gates volume changes of streams aliased to `alias`
pub fn app_op_for_alias(alias: StreamType) -> AppOp {
    match alias {
        VoiceCall => AppOp::AudioVoiceVolume,
        Ring => AppOp::AudioRingVolume,
        Alarm => AppOp::AudioAlarmVolume,
        Notification => AppOp::AudioNotificationVolume,
        BluetoothSco => AppOp::AudioBluetoothVolume,
        _ => AppOp::AudioMediaVolume,
    }
}
