use std::collections::HashMap;

use parking_lot::Mutex;

use crate::{
    buffer::{BufferedRanges, TimeRange},
    config::CodecSwitchPolicy,
    index::ROUNDING_ERROR,
    manifest::Representation,
};

/// What to do with the buffer of a media type when the content loaded into it changes.
#[derive(Debug, Clone, PartialEq)]
pub enum SwitchAction {
    /// Keep the buffer as is.
    Continue,
    /// Remove the ranges, playback is not affected.
    CleanBuffer(Vec<TimeRange>),
    /// Remove the ranges and make the player re-decode from its position.
    FlushBuffer(Vec<TimeRange>),
    /// The sink has to be torn down and created again.
    NeedsReload,
}

pub struct SwitchContext<'a> {
    pub previous: &'a Representation,
    pub next: &'a Representation,
    pub policy: CodecSwitchPolicy,
    /// Position from which the new content is loaded.
    pub switch_point: f64,
    pub position: f64,
    /// End of the period the new content belongs to.
    pub period_end: Option<f64>,
    pub buffered: &'a BufferedRanges,
}

fn codec_family(codec: &str) -> &str {
    codec.split('.').next().unwrap_or(codec).trim()
}

/// Same container, same codec family.
pub fn are_codecs_compatible(a: &Representation, b: &Representation) -> bool {
    let same_codec = match (&a.codec, &b.codec) {
        (Some(a), Some(b)) => codec_family(a).eq_ignore_ascii_case(codec_family(b)),
        (None, None) => true,
        _ => false,
    };
    a.mime_type == b.mime_type && same_codec
}

pub fn get_switch_action(context: &SwitchContext<'_>) -> SwitchAction {
    if are_codecs_compatible(context.previous, context.next) {
        return SwitchAction::Continue;
    }
    if context.policy == CodecSwitchPolicy::Reload {
        return SwitchAction::NeedsReload;
    }

    let end = context.period_end.unwrap_or(f64::INFINITY);
    let is_future = context.switch_point > context.position + ROUNDING_ERROR;
    let start = if is_future {
        context.switch_point
    } else {
        context.position
    };
    let ranges = context.buffered.intersection(start, end);
    if ranges.is_empty() {
        SwitchAction::Continue
    } else if is_future {
        SwitchAction::CleanBuffer(ranges)
    } else {
        SwitchAction::FlushBuffer(ranges)
    }
}

/// Tells whether the media pipeline can play a `mimeType;codecs="..."` string.
pub trait CodecSupportProbe: Send + Sync {
    fn is_supported(&self, codec: &str) -> bool;
}

impl<F> CodecSupportProbe for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_supported(&self, codec: &str) -> bool {
        self(codec)
    }
}

/// Memoizes a [CodecSupportProbe]. Emptied when it grows over its capacity.
pub struct CodecSupportCache {
    probe: Box<dyn CodecSupportProbe>,
    capacity: usize,
    cache: Mutex<HashMap<String, bool>>,
}

impl CodecSupportCache {
    pub fn new(probe: impl CodecSupportProbe + 'static, capacity: usize) -> Self {
        Self {
            probe: Box::new(probe),
            capacity: capacity.max(1),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// A cache accepting every codec.
    pub fn permissive() -> Self {
        Self::new(|_: &str| true, 1)
    }

    pub fn is_supported(&self, codec: &str) -> bool {
        if let Some(supported) = self.cache.lock().get(codec) {
            return *supported;
        }

        let supported = self.probe.is_supported(codec);
        let mut cache = self.cache.lock();
        if cache.len() >= self.capacity {
            tracing::debug!(capacity = self.capacity, "Codec support cache full, clearing");
            cache.clear();
        }
        cache.insert(codec.to_string(), supported);
        supported
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}
