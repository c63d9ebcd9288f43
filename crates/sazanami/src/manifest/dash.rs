//! Conversion of a parsed MPD into the [Manifest] model.
//!
//! References:
//! - [DASH-IF implementation guidelines: restricted timing model](https://dashif.org/Guidelines-TimingModel)
//! - https://github.com/emarsden/dash-mpd-rs/blob/main/src/fetch.rs
use std::{collections::HashMap, sync::Arc};

use dash_mpd::{
    AdaptationSet, Initialization, SegmentBase, SegmentList, SegmentTemplate, SegmentTimeline, MPD,
};
use url::Url;

use super::{
    base_url::{is_absolute_url, merge_baseurls, merge_template},
    Adaptation, Clock, Manifest, MediaType, Period, Representation,
};
use crate::{
    error::{SazanamiError, SazanamiResult},
    index::{
        url_template::TemplateArgs, IndexContext, InitSegmentInfo, SegmentIndex, StaticIndex,
        TemplateIndex, TimelineEntry, TimelineIndex,
    },
    util::range::ByteRange,
};

/// Parse an MPD document and convert it.
pub fn parse(text: &str, url: Option<&Url>, clock: &Clock) -> SazanamiResult<Manifest> {
    let mpd = dash_mpd::parse(text)?;
    from_mpd(&mpd, url, clock)
}

pub fn from_mpd(mpd: &MPD, url: Option<&Url>, clock: &Clock) -> SazanamiResult<Manifest> {
    let is_dynamic = mpd.mpdtype.as_deref() == Some("dynamic");

    let mpd_base_url = mpd.base_url.first().map(|u| u.base.as_str());
    let base_url = match (mpd_base_url, url) {
        (Some(mpd_base_url), Some(url)) => merge_baseurls(url, mpd_base_url)?,
        (None, Some(url)) => url.clone(),
        (Some(mpd_base_url), None) if is_absolute_url(mpd_base_url) => Url::parse(mpd_base_url)?,
        _ => return Err(SazanamiError::Manifest("Invalid base url".to_string())),
    };

    let bounds = period_bounds(mpd, is_dynamic)?;
    let mut periods = Vec::with_capacity(mpd.periods.len());
    for (i, (period, (start, end))) in mpd.periods.iter().zip(bounds).enumerate() {
        let period_base_url = match period.BaseURL.first() {
            Some(u) => merge_baseurls(&base_url, &u.base)?,
            None => base_url.clone(),
        };
        let id = period.id.clone().unwrap_or_else(|| format!("period-{i}"));
        let inherited = Addressing {
            template: period.SegmentTemplate.as_ref().map(TemplateValues::from),
            list: period.SegmentList.as_ref(),
            base: period.SegmentBase.as_ref(),
        };

        let scope = PeriodScope {
            start,
            end,
            is_dynamic,
        };
        let mut adaptations: HashMap<MediaType, Vec<Arc<Adaptation>>> = HashMap::new();
        for (j, adaptation_set) in period.adaptations.iter().enumerate() {
            let Some(adaptation) =
                convert_adaptation(adaptation_set, j, &period_base_url, &inherited, &scope)?
            else {
                continue;
            };
            adaptations
                .entry(adaptation.media_type)
                .or_default()
                .push(Arc::new(adaptation));
        }

        periods.push(Arc::new(Period {
            id,
            start,
            end,
            adaptations,
        }));
    }

    let mut manifest = Manifest {
        url: url.cloned(),
        is_dynamic,
        availability_start_time: mpd
            .availabilityStartTime
            .map(|t| t.timestamp_millis() as f64 / 1000.)
            .unwrap_or_default(),
        time_shift_buffer_depth: mpd.timeShiftBufferDepth.map(|d| d.as_secs_f64()),
        clock_offset: clock.offset_secs(),
        suggested_presentation_delay: mpd.suggestedPresentationDelay.map(|d| d.as_secs_f64()),
        minimum_update_period: mpd.minimumUpdatePeriod.map(|d| d.as_secs_f64()),
        periods,
        live: None,
    };
    if is_dynamic {
        manifest.set_wall_clock(clock.unix_now());
    }
    Ok(manifest)
}

/// Start and end of every period, in seconds from the presentation zero point.
///
/// A period without `@start` starts where the previous one ends. A period
/// without `@duration` ends where the next one starts, the last one at
/// `@mediaPresentationDuration` or never for live content.
fn period_bounds(mpd: &MPD, is_dynamic: bool) -> SazanamiResult<Vec<(f64, Option<f64>)>> {
    let mut bounds: Vec<(f64, Option<f64>)> = Vec::with_capacity(mpd.periods.len());
    for period in mpd.periods.iter() {
        let start = match (period.start, bounds.last()) {
            (Some(start), _) => start.as_secs_f64(),
            (None, None) => 0.,
            (None, Some((_, Some(previous_end)))) => *previous_end,
            (None, Some((_, None))) => {
                return Err(SazanamiError::Manifest(
                    "Missing start time of a period following an open period".to_string(),
                ))
            }
        };
        if let Some((_, previous_end)) = bounds.last_mut() {
            previous_end.get_or_insert(start);
        }
        bounds.push((start, period.duration.map(|d| start + d.as_secs_f64())));
    }

    if let Some((_, end @ None)) = bounds.last_mut() {
        let total = mpd.mediaPresentationDuration.map(|d| d.as_secs_f64());
        if !is_dynamic || total.is_some() {
            *end = total;
        }
    }
    Ok(bounds)
}

struct PeriodScope {
    start: f64,
    end: Option<f64>,
    is_dynamic: bool,
}

/// `SegmentTemplate` attributes, each inherited separately from the enclosing levels.
#[derive(Clone, Default)]
struct TemplateValues<'a> {
    media: Option<&'a str>,
    initialization: Option<&'a str>,
    timescale: Option<u64>,
    start_number: Option<u64>,
    duration: Option<f64>,
    presentation_time_offset: Option<u64>,
    availability_time_offset: Option<f64>,
    timeline: Option<&'a SegmentTimeline>,
}

impl<'a> From<&'a SegmentTemplate> for TemplateValues<'a> {
    fn from(template: &'a SegmentTemplate) -> Self {
        Self {
            media: template.media.as_deref(),
            initialization: template.initialization.as_deref(),
            timescale: template.timescale,
            start_number: template.startNumber,
            duration: template.duration,
            presentation_time_offset: template.presentationTimeOffset,
            availability_time_offset: template.availabilityTimeOffset,
            timeline: template.SegmentTimeline.as_ref(),
        }
    }
}

impl<'a> TemplateValues<'a> {
    fn or(self, parent: &Self) -> Self {
        Self {
            media: self.media.or(parent.media),
            initialization: self.initialization.or(parent.initialization),
            timescale: self.timescale.or(parent.timescale),
            start_number: self.start_number.or(parent.start_number),
            duration: self.duration.or(parent.duration),
            presentation_time_offset: self
                .presentation_time_offset
                .or(parent.presentation_time_offset),
            availability_time_offset: self
                .availability_time_offset
                .or(parent.availability_time_offset),
            timeline: self.timeline.or(parent.timeline),
        }
    }
}

#[derive(Clone, Default)]
struct Addressing<'a> {
    template: Option<TemplateValues<'a>>,
    list: Option<&'a SegmentList>,
    base: Option<&'a SegmentBase>,
}

impl<'a> Addressing<'a> {
    fn inherit(
        template: Option<&'a SegmentTemplate>,
        list: Option<&'a SegmentList>,
        base: Option<&'a SegmentBase>,
        parent: &Self,
    ) -> Self {
        let template = match (template.map(TemplateValues::from), &parent.template) {
            (Some(own), Some(parent)) => Some(own.or(parent)),
            (own, parent) => own.or_else(|| parent.clone()),
        };
        Self {
            template,
            list: list.or(parent.list),
            base: base.or(parent.base),
        }
    }
}

fn media_type_of(adaptation_set: &AdaptationSet) -> Option<MediaType> {
    let codecs = adaptation_set
        .codecs
        .as_deref()
        .or_else(|| {
            adaptation_set
                .representations
                .iter()
                .find_map(|r| r.codecs.as_deref())
        })
        .unwrap_or_default();
    if ["stpp", "wvtt"].iter().any(|c| codecs.starts_with(c)) {
        return Some(MediaType::Text);
    }

    adaptation_set
        .contentType
        .as_deref()
        .and_then(MediaType::from_content_type)
        .or_else(|| {
            adaptation_set
                .mimeType
                .as_deref()
                .and_then(MediaType::from_content_type)
        })
        .or_else(|| {
            adaptation_set
                .representations
                .iter()
                .filter_map(|r| r.mimeType.as_deref())
                .find_map(MediaType::from_content_type)
        })
}

fn convert_adaptation(
    adaptation_set: &AdaptationSet,
    index: usize,
    base_url: &Url,
    inherited: &Addressing<'_>,
    scope: &PeriodScope,
) -> SazanamiResult<Option<Adaptation>> {
    let id = adaptation_set
        .id
        .clone()
        .unwrap_or_else(|| index.to_string());
    let Some(media_type) = media_type_of(adaptation_set) else {
        tracing::debug!(adaptation = %id, "Skipping adaptation set of unknown type");
        return Ok(None);
    };

    let base_url = match adaptation_set.BaseURL.first() {
        Some(u) => merge_baseurls(base_url, &u.base)?,
        None => base_url.clone(),
    };
    let addressing = Addressing::inherit(
        adaptation_set.SegmentTemplate.as_ref(),
        adaptation_set.SegmentList.as_ref(),
        adaptation_set.SegmentBase.as_ref(),
        inherited,
    );

    let roles: Vec<&str> = adaptation_set
        .Role
        .iter()
        .filter_map(|r| r.value.as_deref())
        .collect();

    let mut representations = Vec::with_capacity(adaptation_set.representations.len());
    for (k, representation) in adaptation_set.representations.iter().enumerate() {
        let rep_id = representation
            .id
            .clone()
            .unwrap_or_else(|| format!("{id}-{k}"));
        let bitrate = representation.bandwidth.unwrap_or_default();
        let rep_base_url = match representation.BaseURL.first() {
            Some(u) => merge_baseurls(&base_url, &u.base)?,
            None => base_url.clone(),
        };
        let addressing = Addressing::inherit(
            representation.SegmentTemplate.as_ref(),
            representation.SegmentList.as_ref(),
            representation.SegmentBase.as_ref(),
            &addressing,
        );

        let index = build_index(&rep_id, bitrate, &rep_base_url, &addressing, scope)?;
        representations.push(Arc::new(Representation {
            id: rep_id,
            bitrate,
            codec: representation
                .codecs
                .clone()
                .or_else(|| adaptation_set.codecs.clone()),
            mime_type: representation
                .mimeType
                .clone()
                .or_else(|| adaptation_set.mimeType.clone()),
            width: representation.width,
            height: representation.height,
            index,
        }));
    }
    if representations.is_empty() {
        return Ok(None);
    }
    representations.sort_by_key(|r| r.bitrate);

    Ok(Some(Adaptation {
        id,
        media_type,
        language: adaptation_set.lang.clone(),
        is_audio_description: roles.contains(&"description"),
        is_closed_caption: roles.contains(&"caption"),
        representations,
    }))
}

fn init_info(
    initialization: Option<&Initialization>,
    base_url: &Url,
) -> SazanamiResult<Option<InitSegmentInfo>> {
    let Some(initialization) = initialization else {
        return Ok(None);
    };
    let url = match &initialization.sourceURL {
        Some(source) => merge_baseurls(base_url, source)?,
        None => base_url.clone(),
    };
    Ok(Some(InitSegmentInfo {
        url: Some(url),
        byte_range: initialization.range.as_deref().map(ByteRange::parse).transpose()?,
    }))
}

fn build_index(
    id: &str,
    bitrate: u64,
    base_url: &Url,
    addressing: &Addressing<'_>,
    scope: &PeriodScope,
) -> SazanamiResult<SegmentIndex> {
    let context = |timescale: Option<u64>, presentation_time_offset: Option<u64>| {
        let mut context = IndexContext::new(id, timescale.unwrap_or(1))
            .with_period(scope.start, scope.end);
        context.bandwidth = bitrate;
        context.is_dynamic = scope.is_dynamic;
        context.presentation_time_offset = presentation_time_offset.unwrap_or_default();
        context
    };

    if let Some(template) = &addressing.template {
        if let Some(media) = template.media {
            let mut context = context(template.timescale, template.presentation_time_offset);
            context.availability_time_offset = template.availability_time_offset.unwrap_or_default();
            context.init = match template.initialization {
                Some(initialization) => {
                    let resolved = TemplateArgs::new(id, bitrate).resolve(initialization);
                    Some(InitSegmentInfo {
                        url: Some(merge_baseurls(base_url, &resolved)?),
                        byte_range: None,
                    })
                }
                None => None,
            };
            let media = merge_template(base_url, media)?;
            let start_number = template.start_number.unwrap_or(1);

            if let Some(timeline) = template.timeline {
                let entries = timeline_entries(timeline);
                return Ok(SegmentIndex::Timeline(TimelineIndex::new(
                    context,
                    entries,
                    Some(start_number),
                    Some(media),
                )));
            }
            let duration = template.duration.ok_or_else(|| {
                SazanamiError::Manifest(format!("Missing duration in SegmentTemplate of {id}"))
            })?;
            return Ok(SegmentIndex::Template(TemplateIndex::new(
                context,
                duration.round() as u64,
                start_number,
                media,
            )));
        }
    }

    if let Some(list) = addressing.list {
        // SegmentList carries no @presentationTimeOffset, it comes from SegmentBase
        let presentation_time_offset = addressing.base.and_then(|b| b.presentationTimeOffset);
        let timescale = list
            .timescale
            .or_else(|| addressing.base.and_then(|b| b.timescale));
        let mut context = context(timescale, presentation_time_offset);
        context.init = init_info(list.Initialization.as_ref(), base_url)?;
        let duration = list.duration.ok_or_else(|| {
            SazanamiError::Manifest(format!("Missing duration in SegmentList of {id}"))
        })?;
        let mut entries = Vec::with_capacity(list.segment_urls.len());
        for (i, segment_url) in list.segment_urls.iter().enumerate() {
            let mut entry = TimelineEntry::new(
                context.presentation_time_offset + i as u64 * duration,
                duration,
                0,
            );
            entry.url = Some(match &segment_url.media {
                Some(media) => merge_baseurls(base_url, media)?,
                None => base_url.clone(),
            });
            entry.byte_range = segment_url
                .mediaRange
                .as_deref()
                .map(ByteRange::parse)
                .transpose()?;
            entries.push(entry);
        }
        return Ok(SegmentIndex::Timeline(TimelineIndex::new(
            context,
            entries,
            Some(1),
            None,
        )));
    }

    let (timescale, presentation_time_offset, initialization) = match addressing.base {
        Some(base) => (
            base.timescale,
            base.presentationTimeOffset,
            base.Initialization.as_ref(),
        ),
        None => (None, None, None),
    };
    let mut context = context(timescale, presentation_time_offset);
    context.init = init_info(initialization, base_url)?;
    Ok(SegmentIndex::Static(StaticIndex::new(
        context,
        Some(base_url.clone()),
    )))
}

/// Expand `S` elements, filling the omitted `@t` from the previous entry.
fn timeline_entries(timeline: &SegmentTimeline) -> Vec<TimelineEntry> {
    let mut entries = Vec::with_capacity(timeline.segments.len());
    let mut next_start = Some(0);
    for s in timeline.segments.iter() {
        let Some(start) = s.t.or(next_start) else {
            tracing::warn!("Timeline entry without start after an open repeat, ignoring");
            continue;
        };
        let repeat = s.r.unwrap_or_default();
        next_start = (repeat >= 0).then(|| start + s.d * (repeat as u64 + 1));
        entries.push(TimelineEntry::new(start, s.d, repeat));
    }
    entries
}
