use serde::Serialize;

/// Paths with more segments than this are elided in the middle.
pub const MAX_SEGMENTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "text", rename_all = "lowercase")]
pub enum Crumb {
    Segment(String),
    /// The last segment, rendered distinctly.
    Current(String),
    Ellipsis,
}

/// Breadcrumb for a selected file path.
///
/// Up to [`MAX_SEGMENTS`] segments are shown in full; longer paths show the
/// first segment, an ellipsis and the last segment.
pub fn breadcrumb(path: &str) -> Vec<Crumb> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some((last, init)) = segments.split_last() else {
        return Vec::new();
    };

    if segments.len() <= MAX_SEGMENTS {
        init.iter()
            .map(|s| Crumb::Segment(s.to_string()))
            .chain(std::iter::once(Crumb::Current(last.to_string())))
            .collect()
    } else {
        vec![
            Crumb::Segment(segments[0].to_string()),
            Crumb::Ellipsis,
            Crumb::Current(last.to_string()),
        ]
    }
}

pub fn render_text(crumbs: &[Crumb]) -> String {
    crumbs
        .iter()
        .map(|c| match c {
            Crumb::Segment(s) => s.clone(),
            Crumb::Current(s) => format!("[{}]", s),
            Crumb::Ellipsis => "…".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" / ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(s: &str) -> Crumb {
        Crumb::Segment(s.into())
    }

    fn cur(s: &str) -> Crumb {
        Crumb::Current(s.into())
    }

    #[test]
    fn test_four_segments_render_in_full() {
        assert_eq!(
            breadcrumb("a/b/c/d.ts"),
            vec![seg("a"), seg("b"), seg("c"), cur("d.ts")]
        );
    }

    #[test]
    fn test_five_segments_elide_the_middle() {
        assert_eq!(
            breadcrumb("a/b/c/d/e.ts"),
            vec![seg("a"), Crumb::Ellipsis, cur("e.ts")]
        );
    }

    #[test]
    fn test_single_segment_is_current() {
        assert_eq!(breadcrumb("index.ts"), vec![cur("index.ts")]);
        assert!(breadcrumb("").is_empty());
    }

    #[test]
    fn test_render_text() {
        assert_eq!(render_text(&breadcrumb("lib/util.ts")), "lib / [util.ts]");
        assert_eq!(
            render_text(&breadcrumb("a/b/c/d/e/f.ts")),
            "a / … / [f.ts]"
        );
    }
}
