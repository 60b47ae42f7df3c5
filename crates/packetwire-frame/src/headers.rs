use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single header value: a string, a list of strings, or a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Text(String),
    List(Vec<String>),
    Number(serde_json::Number),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            HeaderValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            HeaderValue::Number(n) => n.as_u64(),
            HeaderValue::Text(text) => text.trim().parse().ok(),
            HeaderValue::List(_) => None,
        }
    }

    fn into_strings(self) -> Vec<String> {
        match self {
            HeaderValue::Text(text) => vec![text],
            HeaderValue::List(items) => items,
            HeaderValue::Number(n) => vec![n.to_string()],
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Text(text) => f.write_str(text),
            HeaderValue::List(items) => f.write_str(&items.join(", ")),
            HeaderValue::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(value: Vec<String>) -> Self {
        HeaderValue::List(value)
    }
}

impl From<Vec<&str>> for HeaderValue {
    fn from(value: Vec<&str>) -> Self {
        HeaderValue::List(value.into_iter().map(str::to_string).collect())
    }
}

macro_rules! header_value_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for HeaderValue {
                fn from(value: $ty) -> Self {
                    HeaderValue::Number(serde_json::Number::from(value))
                }
            }
        )*
    };
}

header_value_from_int!(u16, u32, u64, usize, i32, i64);

/// Ordered, case-insensitive header multimap.
///
/// Lookups ignore ASCII case. Iteration and serialization keep insertion
/// order and the casing the name was first inserted with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, HeaderValue)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.position(name).map(|idx| &self.entries[idx].1)
    }

    /// First string value for `name`, looking into lists.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            HeaderValue::Text(text) => Some(text),
            HeaderValue::List(items) => items.first().map(String::as_str),
            HeaderValue::Number(_) => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Set `name` to `value`, replacing any previous value.
    ///
    /// An existing entry keeps its position and original casing.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<HeaderValue>,
    ) -> Option<HeaderValue> {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(idx) => Some(std::mem::replace(&mut self.entries[idx].1, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    /// Add `value` under `name`, turning an existing value into a list.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<HeaderValue>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(idx) => {
                let slot = &mut self.entries[idx].1;
                let previous = std::mem::replace(slot, HeaderValue::List(Vec::new()));
                let mut merged = previous.into_strings();
                merged.extend(value.into_strings());
                *slot = HeaderValue::List(merged);
            }
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<HeaderValue> {
        self.position(name).map(|idx| self.entries.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<HeaderValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object of string, string-array or number header values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Headers, A::Error> {
                let mut headers = Headers::new();
                while let Some((name, value)) = access.next_entry::<String, HeaderValue>()? {
                    headers.append(name, value);
                }
                Ok(headers)
            }
        }

        deserializer.deserialize_map(HeadersVisitor)
    }
}
