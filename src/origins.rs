//! Maps URLs to origin keys.
//!
//! An origin (`host:port`) is the unit of rate limiting and adaptive
//! learning. The resolver sits behind a trait so that pipelines under test
//! can pin records to synthetic origins.

use errors::*;

use url::Url;

pub trait OriginResolver: Send + Sync {
    /// Resolves a raw URL to its origin key.
    fn origin(&self, raw_url: &str) -> Result<String>;
}

#[derive(Clone, Debug, Default)]
pub struct UrlOriginResolver;

impl OriginResolver for UrlOriginResolver {
    fn origin(&self, raw_url: &str) -> Result<String> {
        let url = Url::parse(raw_url).chain_err(|| format!("Error parsing URL: {}", raw_url))?;

        let host = url.host_str()
            .ok_or_else(|| Error::from(format!("URL has no host: {}", raw_url)))?;
        let port = url.port_or_known_default()
            .ok_or_else(|| Error::from(format!("URL has no known port: {}", raw_url)))?;

        Ok(format!("{}:{}", host, port))
    }
}

/// Resolves every URL to one fixed origin. Useful for exercising per-origin
/// behaviour deterministically in tests.
#[derive(Clone, Debug)]
pub struct StaticOriginResolver {
    pub origin: String,
}

impl OriginResolver for StaticOriginResolver {
    fn origin(&self, _raw_url: &str) -> Result<String> {
        Ok(self.origin.clone())
    }
}

#[cfg(test)]
mod tests {
    use origins::*;

    #[test]
    fn test_url_origin_resolver() {
        let resolver = UrlOriginResolver;
        assert_eq!(
            "example.com:443",
            resolver.origin("https://example.com/a/b?c=d").unwrap()
        );
        assert_eq!(
            "example.com:80",
            resolver.origin("http://example.com").unwrap()
        );
        assert_eq!(
            "example.com:8080",
            resolver.origin("http://example.com:8080/x").unwrap()
        );
    }

    #[test]
    fn test_url_origin_resolver_invalid() {
        let resolver = UrlOriginResolver;
        assert!(resolver.origin("not a url").is_err());
        assert!(resolver.origin("mailto:a@example.com").is_err());
    }
}
