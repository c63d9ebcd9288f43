use url::Url;

use crate::error::SazanamiResult;

pub(crate) fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://")
        || s.starts_with("https://")
        || s.starts_with("file://")
        || s.starts_with("ftp://")
}

/// Resolve `new` against `current`, keeping the query of `current` when `new` has none.
///
/// ```text
/// https://example.com/manifest.mpd?auth=secret + /video42.mp4     => https://example.com/video42.mp4?auth=secret
/// https://example.com/manifest.mpd?auth=old    + /video42.mp4?auth=new => https://example.com/video42.mp4?auth=new
/// ```
pub(crate) fn merge_baseurls(current: &Url, new: &str) -> SazanamiResult<Url> {
    if is_absolute_url(new) {
        return Ok(Url::parse(new)?);
    }

    let mut merged = current.join(new)?;
    if merged.query().is_none() {
        merged.set_query(current.query());
    }
    Ok(merged)
}

/// Same as [merge_baseurls] for URL templates, whose `$` identifiers must survive untouched.
pub(crate) fn merge_template(current: &Url, template: &str) -> SazanamiResult<String> {
    Ok(merge_baseurls(current, template)?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_baseurls() {
        let base = Url::parse("https://example.com/live/manifest.mpd?auth=secret").unwrap();
        assert_eq!(
            merge_baseurls(&base, "video/1.m4s").unwrap().as_str(),
            "https://example.com/live/video/1.m4s?auth=secret"
        );
        assert_eq!(
            merge_baseurls(&base, "/v.mp4?auth=new").unwrap().as_str(),
            "https://example.com/v.mp4?auth=new"
        );
        assert_eq!(
            merge_baseurls(&base, "https://cdn.example.com/a/").unwrap().as_str(),
            "https://cdn.example.com/a/"
        );
    }

    #[test]
    fn test_merge_template() {
        let base = Url::parse("https://example.com/live/").unwrap();
        assert_eq!(
            merge_template(&base, "$RepresentationID$/$Number%05d$.m4s").unwrap(),
            "https://example.com/live/$RepresentationID$/$Number%05d$.m4s"
        );
    }
}
