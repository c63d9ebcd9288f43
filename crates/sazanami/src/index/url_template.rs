// References:
// 1. https://github.com/clitic/vsd/blob/30ca1985e4a467ea3304b11c08d3176deaafd22a/vsd/src/dash/template.rs
// 2. https://github.com/emarsden/dash-mpd-rs/blob/6ebdfb4759adbda8233b5b3520804e23ff86e7de/src/fetch.rs#L435-L466

use regex::{Captures, Regex, Replacer};
use std::{collections::HashMap, sync::LazyLock};

// Only %0[width]d is permitted by DASH-IF IOP, so there is no need for a printf implementation.
// Some packagers drop the 0 flag, the value is zero padded all the same.
//
// Example template: "$RepresentationID$/$Number%06d$.m4s"
static TEMPLATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth)(?:%0?(\d+)d)?\$")
        .unwrap_or_else(|e| unreachable!("invalid template regex: {e}"))
});

/// Identifier values known for one representation, used to expand
/// `SegmentTemplate@media` and `SegmentTemplate@initialization`.
#[derive(Debug, Clone, Default)]
pub struct TemplateArgs {
    args: HashMap<&'static str, String>,
}

impl TemplateArgs {
    pub const REPRESENTATION_ID: &'static str = "RepresentationID";
    pub const NUMBER: &'static str = "Number";
    pub const TIME: &'static str = "Time";
    pub const BANDWIDTH: &'static str = "Bandwidth";

    pub fn new(representation_id: &str, bandwidth: u64) -> Self {
        let mut args = HashMap::with_capacity(4);
        args.insert(Self::REPRESENTATION_ID, representation_id.to_string());
        args.insert(Self::BANDWIDTH, bandwidth.to_string());
        Self { args }
    }

    pub fn with_segment(&self, number: Option<u64>, time: u64) -> Self {
        let mut args = self.args.clone();
        if let Some(number) = number {
            args.insert(Self::NUMBER, number.to_string());
        }
        args.insert(Self::TIME, time.to_string());
        Self { args }
    }

    pub fn insert(&mut self, key: &'static str, value: String) -> &mut Self {
        self.args.insert(key, value);
        self
    }

    pub fn resolve(&self, template: &str) -> String {
        TEMPLATE_REGEX
            .replace_all(template, TemplateReplacer(&self.args))
            .to_string()
    }
}

struct TemplateReplacer<'a>(&'a HashMap<&'static str, String>);

impl Replacer for TemplateReplacer<'_> {
    fn replace_append(&mut self, caps: &Captures<'_>, dst: &mut String) {
        let whole = caps.get(0).map_or("", |m| m.as_str());
        let Some(value) = caps.get(1).and_then(|key| self.0.get(key.as_str())) else {
            dst.push_str(whole);
            return;
        };

        match caps.get(2).and_then(|m| m.as_str().parse::<usize>().ok()) {
            Some(width) => dst.push_str(&format!("{value:0>width$}")),
            None => dst.push_str(value),
        }
    }
}
