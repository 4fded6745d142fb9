use crate::core::page::{Element, ElementHandle, Page};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Where a post keeps its identity and images.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub post_tag: String,
    pub time_tag: String,
    pub datetime_attr: String,
    pub link_tag: String,
    pub permalink_marker: String,
    pub author_attr: String,
    pub author_value: String,
    pub image_tag: String,
    pub image_attr: String,
    pub allowed_schemes: Vec<String>,
    pub excluded_substrings: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            post_tag: "article".to_string(),
            time_tag: "time".to_string(),
            datetime_attr: "datetime".to_string(),
            link_tag: "a".to_string(),
            permalink_marker: "status/".to_string(),
            author_attr: "data-testid".to_string(),
            author_value: "User-Name".to_string(),
            image_tag: "img".to_string(),
            image_attr: "src".to_string(),
            allowed_schemes: vec!["http://".to_string(), "https://".to_string()],
            excluded_substrings: vec!["emoji".to_string()],
        }
    }
}

pub type UrlPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// URL must start with one of `schemes` (ASCII case-insensitive).
pub fn scheme_predicate(schemes: Vec<String>) -> UrlPredicate {
    Arc::new(move |url: &str| {
        schemes.iter().any(|scheme| {
            url.get(..scheme.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
        })
    })
}

/// URL must not contain any of `markers` (decorative glyph hosting paths).
pub fn glyph_predicate(markers: Vec<String>) -> UrlPredicate {
    Arc::new(move |url: &str| !markers.iter().any(|m| url.contains(m.as_str())))
}

/// Conjunction of URL predicates; an image is kept only if all accept it.
#[derive(Clone)]
pub struct ImageFilter {
    predicates: Vec<UrlPredicate>,
}

impl ImageFilter {
    pub fn from_config(config: &ExtractorConfig) -> Self {
        Self {
            predicates: vec![
                Arc::new(|url: &str| !url.trim().is_empty()),
                scheme_predicate(config.allowed_schemes.clone()),
                glyph_predicate(config.excluded_substrings.clone()),
            ],
        }
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub fn accepts(&self, url: &str) -> bool {
        self.predicates.iter().all(|p| p(url))
    }
}

impl fmt::Debug for ImageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageFilter")
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PostExtractor {
    config: ExtractorConfig,
    filter: ImageFilter,
}

impl PostExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        let filter = ImageFilter::from_config(&config);
        Self { config, filter }
    }

    pub fn with_filter(mut self, filter: ImageFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn post_tag(&self) -> &str {
        &self.config.post_tag
    }

    pub fn is_post(&self, element: &Element) -> bool {
        element.tag.eq_ignore_ascii_case(&self.config.post_tag)
    }

    /// Post-shaped elements at or under `handle`, in document order.
    pub fn posts_in(&self, page: &Page, handle: ElementHandle) -> Vec<ElementHandle> {
        let Some(element) = page.get(handle) else {
            return Vec::new();
        };
        if self.is_post(element) {
            return vec![handle];
        }
        page.query_all(handle, &self.config.post_tag)
    }

    /// `{author}-{datetime}`, or `None` when the publication marker, its
    /// permalink, or the author handle is missing.
    pub fn identify(&self, page: &Page, post: ElementHandle) -> Option<String> {
        let time = page.query_first(post, &self.config.time_tag)?;
        let datetime = page
            .attr(time, &self.config.datetime_attr)
            .filter(|d| !d.is_empty())?;

        let link = page.closest(time, &self.config.link_tag)?;
        let href = page.attr(link, "href")?;
        if !self.is_permalink(href) {
            return None;
        }

        let author = page
            .descendants_where(post, |e| {
                e.attr(&self.config.author_attr) == Some(self.config.author_value.as_str())
            })
            .into_iter()
            .next()?;
        let author = page.text_content(author);
        let author = author.trim();
        if author.is_empty() {
            return None;
        }

        Some(format!("{}-{}", author, datetime))
    }

    fn is_permalink(&self, href: &str) -> bool {
        href.match_indices(self.config.permalink_marker.as_str())
            .any(|(at, marker)| {
                href[at + marker.len()..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_digit())
            })
    }

    /// Candidate image URLs in document order, duplicates kept.
    pub fn extract_images(&self, page: &Page, post: ElementHandle) -> Vec<String> {
        page.query_all(post, &self.config.image_tag)
            .into_iter()
            .filter_map(|img| page.attr(img, &self.config.image_attr))
            .filter(|src| self.filter.accepts(src))
            .map(str::to_string)
            .collect()
    }
}

impl Default for PostExtractor {
    fn default() -> Self {
        Self::new(ExtractorConfig::default())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::page::ElementSpec;

    /// A post shaped like the timeline markup the extractor expects.
    pub(crate) fn post_spec(author: &str, datetime: &str, images: &[&str]) -> ElementSpec {
        let mut post = ElementSpec::new("article")
            .child(
                ElementSpec::new("div")
                    .attr("data-testid", "User-Name")
                    .child(ElementSpec::new("span").text(author)),
            )
            .child(
                ElementSpec::new("a")
                    .attr("href", format!("https://x.com/{author}/status/1234"))
                    .child(ElementSpec::new("time").attr("datetime", datetime)),
            );
        for src in images {
            post = post.child(ElementSpec::new("img").attr("src", *src));
        }
        post
    }

    fn single(spec: ElementSpec) -> (Page, ElementHandle) {
        let mut page = Page::new();
        let root = page.root();
        let post = page.append(root, spec).unwrap();
        (page, post)
    }

    #[test]
    fn test_identify_uses_author_and_datetime() {
        let (page, post) = single(post_spec("@alice", "2024-05-01T10:00:00Z", &[]));
        let extractor = PostExtractor::default();

        assert_eq!(
            extractor.identify(&page, post).as_deref(),
            Some("@alice-2024-05-01T10:00:00Z")
        );
    }

    #[test]
    fn test_identify_requires_time_marker() {
        let spec = ElementSpec::new("article").child(
            ElementSpec::new("div")
                .attr("data-testid", "User-Name")
                .text("@bob"),
        );
        let (page, post) = single(spec);
        assert_eq!(PostExtractor::default().identify(&page, post), None);
    }

    #[test]
    fn test_identify_requires_author() {
        let spec = ElementSpec::new("article").child(
            ElementSpec::new("a")
                .attr("href", "/bob/status/99")
                .child(ElementSpec::new("time").attr("datetime", "2024")),
        );
        let (page, post) = single(spec);
        assert_eq!(PostExtractor::default().identify(&page, post), None);
    }

    #[test]
    fn test_identify_requires_permalink() {
        let spec = ElementSpec::new("article")
            .child(
                ElementSpec::new("div")
                    .attr("data-testid", "User-Name")
                    .text("@bob"),
            )
            .child(
                ElementSpec::new("a")
                    .attr("href", "/bob/status/latest")
                    .child(ElementSpec::new("time").attr("datetime", "2024")),
            );
        let (page, post) = single(spec);
        assert_eq!(PostExtractor::default().identify(&page, post), None);
    }

    #[test]
    fn test_extract_images_filters_and_keeps_order() {
        let (page, post) = single(post_spec(
            "@alice",
            "t",
            &[
                "https://x/b.png",
                "data:image/png;base64,AAAA",
                "https://abs.twimg.com/emoji/v2/svg/1f600.svg",
                "",
                "HTTPS://x/a.png",
                "https://x/b.png",
                "/relative.png",
            ],
        ));

        let images = PostExtractor::default().extract_images(&page, post);

        assert_eq!(
            images,
            vec!["https://x/b.png", "HTTPS://x/a.png", "https://x/b.png"]
        );
    }

    #[test]
    fn test_custom_predicate_is_applied() {
        let (page, post) = single(post_spec(
            "@alice",
            "t",
            &["https://x/avatar_normal.jpg", "https://x/media.jpg"],
        ));
        let config = ExtractorConfig::default();
        let filter =
            ImageFilter::from_config(&config).with_predicate(|url| !url.contains("avatar"));
        let extractor = PostExtractor::new(config).with_filter(filter);

        assert_eq!(
            extractor.extract_images(&page, post),
            vec!["https://x/media.jpg"]
        );
    }

    #[test]
    fn test_posts_in_finds_nested_posts() {
        let mut page = Page::new();
        let root = page.root();
        let wrapper = page
            .append(
                root,
                ElementSpec::new("div")
                    .child(post_spec("@a", "1", &[]))
                    .child(ElementSpec::new("section").child(post_spec("@b", "2", &[]))),
            )
            .unwrap();
        let extractor = PostExtractor::default();

        let posts = extractor.posts_in(&page, wrapper);
        assert_eq!(posts.len(), 2);
        assert_eq!(extractor.posts_in(&page, posts[0]), vec![posts[0]]);
    }
}
