use std::fmt;

use url::{form_urlencoded, Url};

use crate::error::ConversionError;

/// Cache identity of a request: every query pair, in the order received,
/// with the `url` value normalized.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            match Url::parse(value) {
                Ok(url) if key == "url" => serializer.append_pair(key, url.as_str()),
                _ => serializer.append_pair(key, value),
            };
        }
        Fingerprint(serializer.finish())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An inbound `/convert` request: who asked, and the raw query pairs.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub client_id: String,
    pub params: Vec<(String, String)>,
}

impl RequestContext {
    pub fn new(client_id: impl Into<String>, params: Vec<(String, String)>) -> Self {
        RequestContext {
            client_id: client_id.into(),
            params,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_pairs(self.params.iter().map(|(k, v)| (k, v)))
    }

    /// The URL to fetch: the `url` parameter with every other parameter
    /// appended to its query string, in received order.
    pub fn source_url(&self) -> Result<Url, ConversionError> {
        let position = self
            .params
            .iter()
            .position(|(key, value)| key == "url" && !value.trim().is_empty())
            .ok_or_else(|| ConversionError::Validation("Image URL is required".into()))?;

        let mut url = Url::parse(self.params[position].1.trim())
            .map_err(|_| ConversionError::Validation("Invalid image URL".into()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConversionError::Validation("Invalid image URL".into()));
        }

        let extra: Vec<_> = self
            .params
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != position)
            .map(|(_, pair)| pair)
            .collect();
        if !extra.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in extra {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }
}
