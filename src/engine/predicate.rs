use crate::config::default_block_markers;

/// Decides whether a decoded body is unusable and the fetch must go again
/// through another exit address.
pub trait ResponsePredicate: Send + Sync {
    fn rejects(&self, body: &str) -> bool;
}

impl<F> ResponsePredicate for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn rejects(&self, body: &str) -> bool {
        self(body)
    }
}

/// Rejects empty bodies and known proxy/anti-bot error pages.
#[derive(Debug, Clone)]
pub struct BlockPageDetector {
    markers: Vec<String>,
}

impl BlockPageDetector {
    pub fn new(markers: Vec<String>) -> Self {
        Self { markers }
    }
}

impl Default for BlockPageDetector {
    fn default() -> Self {
        Self::new(default_block_markers())
    }
}

impl ResponsePredicate for BlockPageDetector {
    fn rejects(&self, body: &str) -> bool {
        body.is_empty() || self.markers.iter().any(|m| body.contains(m.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_markers() {
        let detector = BlockPageDetector::default();
        assert!(detector.rejects(""));
        assert!(detector.rejects(
            "<h2>ERROR: The requested URL could not be retrieved</h2>"
        ));
        assert!(detector.rejects("squid says ERR_ACCESS_DENIED"));
        assert!(!detector.rejects("<html>real content</html>"));
    }

    #[test]
    fn test_custom_markers_and_closures() {
        let detector = BlockPageDetector::new(vec!["captcha".into()]);
        assert!(detector.rejects("please solve the captcha"));
        assert!(!detector.rejects("ERR_ACCESS_DENIED"));

        let short = |body: &str| body.len() < 5;
        assert!(short.rejects("abc"));
        assert!(!short.rejects("abcdef"));
    }
}
