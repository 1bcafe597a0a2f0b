//! Wire formats and the parsers that turn response bodies into documents.

use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;

use crate::error::FetchError;

/// Which of the two representations of a resource a payload is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// JSON representation.
    Primary,
    /// XML / Atom representation.
    Secondary,
}

impl WireFormat {
    /// Guess the format from a `Content-Type` value.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.contains("json") {
            Some(WireFormat::Primary)
        } else if content_type.contains("xml") || content_type.contains("atom") {
            Some(WireFormat::Secondary)
        } else {
            None
        }
    }

    /// Guess the format from the first significant byte of a body.
    pub fn sniff(body: &[u8]) -> Option<Self> {
        let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
        match body.iter().find(|b| !b.is_ascii_whitespace())? {
            b'{' | b'[' => Some(WireFormat::Primary),
            b'<' => Some(WireFormat::Secondary),
            _ => None,
        }
    }
}

/// Turns a response body into a document.
pub trait DocumentParser: Send + Sync + 'static {
    type Document: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Short format name. Prefixes circuit breaker keys and names the format's cache.
    const NAME: &'static str;

    /// Value of the `Accept` header for requests in this format.
    fn accept(&self) -> &str;

    fn parse(&self, body: &[u8]) -> Result<Self::Document, FetchError>;
}

/// A document in whichever format was fetched.
#[derive(Debug, Clone, PartialEq)]
pub enum Feed<A, B> {
    Primary(A),
    Secondary(B),
}

impl<A, B> Feed<A, B> {
    pub fn format(&self) -> WireFormat {
        match self {
            Feed::Primary(_) => WireFormat::Primary,
            Feed::Secondary(_) => WireFormat::Secondary,
        }
    }

    pub fn primary(self) -> Option<A> {
        match self {
            Feed::Primary(document) => Some(document),
            Feed::Secondary(_) => None,
        }
    }

    pub fn secondary(self) -> Option<B> {
        match self {
            Feed::Primary(_) => None,
            Feed::Secondary(document) => Some(document),
        }
    }
}

/// Deserializes JSON bodies into `T`.
pub struct JsonParser<T> {
    accept: String,
    _document: PhantomData<fn() -> T>,
}

impl<T> JsonParser<T> {
    pub fn new(accept: impl Into<String>) -> Self {
        JsonParser {
            accept: accept.into(),
            _document: PhantomData,
        }
    }
}

impl<T> Default for JsonParser<T> {
    fn default() -> Self {
        Self::new("application/opds+json, application/json;q=0.9")
    }
}

impl<T> DocumentParser for JsonParser<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Document = T;
    const NAME: &'static str = "json";

    fn accept(&self) -> &str {
        &self.accept
    }

    fn parse(&self, body: &[u8]) -> Result<T, FetchError> {
        serde_json::from_slice(body).map_err(|e| FetchError::parse(Self::NAME, e))
    }
}

/// Keeps the body as UTF-8 text for a downstream parser.
#[derive(Debug, Clone, Default)]
pub struct TextParser;

impl DocumentParser for TextParser {
    type Document = String;
    const NAME: &'static str = "xml";

    fn accept(&self) -> &str {
        "application/atom+xml, application/xml;q=0.9, text/xml;q=0.8"
    }

    fn parse(&self, body: &[u8]) -> Result<String, FetchError> {
        let text = std::str::from_utf8(body).map_err(|e| FetchError::parse(Self::NAME, e))?;
        if WireFormat::sniff(body) != Some(WireFormat::Secondary) {
            return Err(FetchError::parse(Self::NAME, "body is not markup"));
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Catalog {
        title: String,
    }

    #[test]
    fn test_content_type_detection() {
        assert_eq!(
            WireFormat::from_content_type("application/opds+json; charset=utf-8"),
            Some(WireFormat::Primary)
        );
        assert_eq!(
            WireFormat::from_content_type("Application/Atom+XML;profile=opds-catalog"),
            Some(WireFormat::Secondary)
        );
        assert_eq!(WireFormat::from_content_type("text/html"), None);
    }

    #[test]
    fn test_sniffing() {
        assert_eq!(WireFormat::sniff(b"  {\"a\":1}"), Some(WireFormat::Primary));
        assert_eq!(WireFormat::sniff(b"[1]"), Some(WireFormat::Primary));
        assert_eq!(
            WireFormat::sniff(b"\xEF\xBB\xBF<?xml version=\"1.0\"?>"),
            Some(WireFormat::Secondary)
        );
        assert_eq!(WireFormat::sniff(b""), None);
        assert_eq!(WireFormat::sniff(b"hello"), None);
    }

    #[test]
    fn test_json_parser() {
        let parser = JsonParser::<Catalog>::default();
        assert_eq!(
            parser.parse(br#"{"title":"Library"}"#).unwrap(),
            Catalog {
                title: "Library".into()
            }
        );
        assert!(matches!(
            parser.parse(b"<feed/>"),
            Err(FetchError::Parse { .. })
        ));
    }

    #[test]
    fn test_text_parser_rejects_non_markup() {
        assert_eq!(TextParser.parse(b"<feed/>").unwrap(), "<feed/>");
        assert!(TextParser.parse(b"{}").is_err());
    }

    #[test]
    fn test_feed_accessors() {
        let feed: Feed<u8, String> = Feed::Secondary("x".into());
        assert_eq!(feed.format(), WireFormat::Secondary);
        assert_eq!(feed.clone().secondary(), Some("x".to_string()));
        assert_eq!(feed.primary(), None);
    }
}
