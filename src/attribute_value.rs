use std::borrow::Cow;
use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{self, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::util::{f64_to_i64_safe, number_to_string};

lazy_static! {
    static ref VERSION_NUMERIC_COMPONENTS_REGEX: Regex =
        Regex::new(r"^\d+(\.\d+)?(\.\d+)?").unwrap();
}

/// A comparand carried by a [crate::RolloutStrategyAttribute].
///
/// The server sends these as arbitrary JSON scalars; the attribute's declared field type decides
/// how each side of a comparison is interpreted at evaluation time.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Stores a string value.
    String(String),
    /// Stores an array of attribute values.
    Array(Vec<AttributeValue>),
    /// Stores a number.
    Number(f64),
    /// Stores a boolean.
    Bool(bool),
    /// Stores a map of attribute values.
    Object(HashMap<String, AttributeValue>),
    /// Stores a null value.
    Null,
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> AttributeValue {
        AttributeValue::String(s.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> AttributeValue {
        AttributeValue::String(s)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> AttributeValue {
        AttributeValue::Bool(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Number(i as f64)
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        AttributeValue::Number(f)
    }
}

impl AttributeValue {
    /// Returns None unless self is a String. It will not convert.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the textual form of a scalar, which is what string-class operators compare against.
    pub fn to_text(&self) -> Option<Cow<'_, str>> {
        match self {
            AttributeValue::String(s) => Some(Cow::Borrowed(s)),
            AttributeValue::Number(f) => Some(Cow::Owned(number_to_string(*f))),
            AttributeValue::Bool(b) => Some(Cow::Borrowed(if *b { "true" } else { "false" })),
            _ => None,
        }
    }

    /// Returns the wrapped value as a float for numbers and numeric strings, and None otherwise.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(f) => Some(*f),
            AttributeValue::String(s) => parse_number(s),
            _ => None,
        }
    }

    pub fn to_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            AttributeValue::String(s) => Some(parse_bool(s)),
            _ => None,
        }
    }

    /// Attempt to convert a value into a calendar date. Accepts `YYYY-MM-DD` and full RFC3339
    /// timestamps, of which only the UTC date is kept.
    pub fn to_date(&self) -> Option<NaiveDate> {
        self.as_str().and_then(parse_date)
    }

    /// Attempt to convert any of the following into a chrono::DateTime in UTC:
    ///  * RFC3339/ISO8601 timestamp (example: "2016-04-16T17:09:12.759-07:00")
    ///  * an ISO8601 timestamp without offset, taken to be UTC
    ///  * Unix epoch milliseconds as number
    /// It will return None if the conversion fails or if no conversion is possible.
    pub fn to_datetime(&self) -> Option<chrono::DateTime<Utc>> {
        match self {
            AttributeValue::Number(millis) => {
                f64_to_i64_safe(*millis).and_then(|millis| match Utc.timestamp_millis_opt(millis) {
                    LocalResult::None | LocalResult::Ambiguous(_, _) => None,
                    LocalResult::Single(time) => Some(time),
                })
            }
            AttributeValue::String(s) => parse_datetime(s),
            AttributeValue::Bool(_) | AttributeValue::Null => None,
            other => {
                warn!(
                    "Don't know how or whether to convert attribute value {:?} to datetime",
                    other
                );
                None
            }
        }
    }

    /// Attempt to parse a string attribute into a semver version.
    ///
    /// It will return None if it cannot parse it, or for non-string attributes.
    pub fn as_semver(&self) -> Option<semver::Version> {
        self.as_str().and_then(parse_semver)
    }

    pub fn to_ip_network(&self) -> Option<IpNetwork> {
        self.as_str().and_then(IpNetwork::parse)
    }

    pub(crate) fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }
}

pub(crate) fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|f| f.is_finite())
}

pub(crate) fn parse_bool(s: &str) -> bool {
    s.trim().eq_ignore_ascii_case("true")
}

pub(crate) fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(s).map(|dt| dt.date_naive()))
}

pub(crate) fn parse_datetime(s: &str) -> Option<chrono::DateTime<Utc>> {
    let s = s.trim();
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| Utc.from_utc_datetime(&naive))
        })
}

pub(crate) fn parse_semver(version_str: &str) -> Option<semver::Version> {
    semver::Version::parse(version_str)
        .ok()
        .or_else(|| parse_semver_loose(version_str))
        .map(|mut version| {
            version.build = semver::BuildMetadata::EMPTY;
            version
        })
}

fn parse_semver_loose(version_str: &str) -> Option<semver::Version> {
    let parts = VERSION_NUMERIC_COMPONENTS_REGEX.captures(version_str)?;

    let numeric_parts = parts.get(0)?;
    let mut transformed_version_str = numeric_parts.as_str().to_string();

    for i in 1..parts.len() {
        if parts.get(i).is_none() {
            transformed_version_str.push_str(".0");
        }
    }

    let rest = &version_str[numeric_parts.end()..];
    transformed_version_str.push_str(rest);

    semver::Version::parse(&transformed_version_str).ok()
}

/// An address range in CIDR notation. A bare address is treated as a single-host network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    pub fn parse(s: &str) -> Option<IpNetwork> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr.parse::<IpAddr>().ok()?, Some(prefix.parse::<u8>().ok()?)),
            None => (s.parse::<IpAddr>().ok()?, None),
        };
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = prefix.unwrap_or(max);
        if prefix > max {
            return None;
        }
        Some(IpNetwork { addr, prefix })
    }

    /// True when every address of `other` lies inside this network.
    pub fn contains(&self, other: &IpNetwork) -> bool {
        if other.prefix < self.prefix {
            return false;
        }
        match (self.addr, other.addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;
    use spectral::prelude::*;
    use test_case::test_case;

    #[test]
    fn deserialization() {
        fn test_case(json: &str, expected: AttributeValue) {
            assert_eq!(
                serde_json::from_str::<AttributeValue>(json).unwrap(),
                expected
            );
        }

        test_case("1.0", AttributeValue::Number(1.0));
        test_case("1", AttributeValue::Number(1.0));
        test_case("true", AttributeValue::Bool(true));
        test_case("null", AttributeValue::Null);
        test_case("\"foo\"", AttributeValue::String("foo".to_string()));
        test_case(
            r#"{"foo":123}"#,
            AttributeValue::Object(hashmap!["foo".to_string() => AttributeValue::Number(123.0)]),
        );
    }

    #[test]
    fn text_form_of_scalars() {
        assert_that!(AttributeValue::Number(7.0).to_text().as_deref()).contains_value("7");
        assert_that!(AttributeValue::Bool(true).to_text().as_deref()).contains_value("true");
        assert_that!(AttributeValue::Null.to_text()).is_none();
    }

    #[test]
    fn numeric_strings_convert() {
        assert_that!(AttributeValue::from("12.5").to_f64()).contains_value(12.5);
        assert_that!(AttributeValue::from("Tuesday").to_f64()).is_none();
        assert_that!(AttributeValue::from(3_i64).to_f64()).contains_value(3.0);
    }

    #[test_case("2021-03-04", Some((2021, 3, 4)))]
    #[test_case("2021-03-04T23:30:00-02:00", Some((2021, 3, 5)))]
    #[test_case("04/03/2021", None)]
    fn dates(text: &str, expect: Option<(i32, u32, u32)>) {
        let expect = expect.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d));
        assert_eq!(AttributeValue::from(text).to_date(), expect);
    }

    #[test]
    fn datetimes() {
        let with_offset = AttributeValue::from("2019-11-19T17:29:00-07:00").to_datetime();
        let naive = AttributeValue::from("2019-11-20T00:29:00").to_datetime();
        assert_that!(with_offset).is_some();
        assert_eq!(with_offset, naive);
        assert_that!(AttributeValue::from("fish").to_datetime()).is_none();
    }

    #[test]
    fn loose_semver() {
        assert_eq!(
            AttributeValue::from("2.1").as_semver(),
            semver::Version::parse("2.1.0").ok()
        );
        assert_eq!(
            AttributeValue::from("2.0.0+build").as_semver(),
            semver::Version::parse("2.0.0").ok()
        );
        assert_that!(AttributeValue::from("not.a.version").as_semver()).is_none();
    }

    #[test_case("192.168.0.0/16", "192.168.4.5", true)]
    #[test_case("192.168.0.0/16", "192.169.0.1", false)]
    #[test_case("10.0.0.1", "10.0.0.1", true)]
    #[test_case("10.0.0.1", "10.0.0.2", false)]
    #[test_case("0.0.0.0/0", "8.8.8.8", true)]
    #[test_case("2001:db8::/32", "2001:db8:1::1", true)]
    #[test_case("2001:db8::/32", "2001:db9::1", false)]
    #[test_case("10.0.0.0/8", "2001:db8::1", false)]
    fn cidr_containment(network: &str, ip: &str, expect: bool) {
        let network = IpNetwork::parse(network).unwrap();
        let ip = IpNetwork::parse(ip).unwrap();
        assert_eq!(network.contains(&ip), expect);
    }

    #[test]
    fn invalid_networks() {
        assert_that!(IpNetwork::parse("10.0.0.0/33")).is_none();
        assert_that!(IpNetwork::parse("not-an-ip")).is_none();
    }
}
