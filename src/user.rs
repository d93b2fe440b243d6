use std::collections::HashMap;

use chrono::{self, LocalResult, TimeZone, Utc};
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use sha1::{Digest, Sha1};

use crate::flag_value::f64_to_i64_safe;

const USER_CUSTOM_STARTING_CAPACITY: usize = 10;
const BUCKET_SCALE_INT: i64 = 0x0FFF_FFFF_FFFF_FFFF;
const BUCKET_SCALE: f32 = BUCKET_SCALE_INT as f32;

lazy_static! {
    static ref VERSION_NUMERIC_COMPONENTS_REGEX: Regex =
        Regex::new(r"^\d+(\.\d+)?(\.\d+)?").unwrap();
}

/// An attribute value is any JSON value that can be attached to a user, either as one of the
/// built-in attributes or in the custom attribute map.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Array(Vec<AttributeValue>),
    Int(i64),
    Float(f64),
    Bool(bool),
    Object(HashMap<String, AttributeValue>),
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
    fn from(i: i64) -> AttributeValue {
        AttributeValue::Int(i)
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        AttributeValue::Float(f)
    }
}

impl<T> From<Vec<T>> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from(v: Vec<T>) -> AttributeValue {
        v.into_iter().collect()
    }
}

impl<T> FromIterator<T> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        AttributeValue::Array(iter.into_iter().map(AttributeValue::from).collect())
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

    /// Returns the wrapped value as a float for numeric types, and None otherwise.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Float(f) => Some(*f),
            AttributeValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Returns None unless self is a bool. It will not convert.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Attempt to convert any of the following into a chrono::DateTime in UTC:
    ///  * RFC3339/ISO8601 timestamp (example: "2016-04-16T17:09:12.759-07:00")
    ///  * Unix epoch milliseconds as string
    ///  * Unix epoch milliseconds as number
    ///
    /// Returns None if the conversion fails or no conversion is possible.
    pub fn to_datetime(&self) -> Option<chrono::DateTime<Utc>> {
        match self {
            AttributeValue::Int(millis) => match Utc.timestamp_millis_opt(*millis) {
                LocalResult::Single(time) => Some(time),
                _ => None,
            },
            AttributeValue::Float(millis) => f64_to_i64_safe(*millis)
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
            AttributeValue::String(s) => {
                if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                    Some(dt.with_timezone(&Utc))
                } else if let Ok(millis) = s.parse() {
                    Utc.timestamp_millis_opt(millis).single()
                } else {
                    None
                }
            }
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

    /// Attempt to parse a string attribute into a semver version. Missing minor or patch
    /// components are tolerated ("2" parses as "2.0.0").
    ///
    /// Returns None if it cannot parse it, or for non-string attributes.
    pub fn as_semver(&self) -> Option<semver::Version> {
        let version_str = self.as_str()?;
        semver::Version::parse(version_str)
            .ok()
            .or_else(|| AttributeValue::parse_semver_loose(version_str))
    }

    fn parse_semver_loose(version_str: &str) -> Option<semver::Version> {
        let parts = VERSION_NUMERIC_COMPONENTS_REGEX.captures(version_str)?;

        let numeric_parts = parts.get(0).unwrap();
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

    /// Find the first element (or the value itself, for scalars) satisfying the predicate `p`.
    pub fn find<P>(&self, p: P) -> Option<&AttributeValue>
    where
        P: Fn(&AttributeValue) -> bool,
    {
        match self {
            AttributeValue::String(_)
            | AttributeValue::Int(_)
            | AttributeValue::Float(_)
            | AttributeValue::Bool(_)
            | AttributeValue::Object(_) => {
                if p(self) {
                    Some(self)
                } else {
                    None
                }
            }
            AttributeValue::Array(values) => values.iter().find(|v| p(v)),
            AttributeValue::Null => None,
        }
    }

    /// Only strings and integers can serve as the input of a percentage rollout; everything else
    /// is treated as if the attribute were missing.
    fn as_bucketable(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Int(i) => Some(i.to_string()),
            _ => None,
        }
    }
}

/// The first portion of the input to the bucketing hash: either the key and salt of the flag
/// (or segment) being bucketed, or a fixed experiment seed.
#[derive(Clone, Copy, Debug)]
pub enum BucketPrefix<'a> {
    KeyAndSalt(&'a str, &'a str),
    Seed(i64),
}

impl BucketPrefix<'_> {
    fn write_hash_input(&self, input: &mut String) {
        match self {
            BucketPrefix::KeyAndSalt(key, salt) => {
                input.push_str(key);
                input.push('.');
                input.push_str(salt);
            }
            BucketPrefix::Seed(seed) => input.push_str(&seed.to_string()),
        }
    }
}

/// A user of the application, the subject every flag is evaluated against.
///
/// The `key` is the only mandatory attribute; everything else, including the custom attribute
/// map, exists to be matched by targeting rules.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct User {
    #[serde(rename = "key")]
    _key: String,
    #[serde(rename = "secondary", skip_serializing_if = "Option::is_none")]
    _secondary: Option<String>,
    #[serde(rename = "ip", skip_serializing_if = "Option::is_none")]
    _ip: Option<String>,
    #[serde(rename = "country", skip_serializing_if = "Option::is_none")]
    _country: Option<String>,
    #[serde(rename = "email", skip_serializing_if = "Option::is_none")]
    _email: Option<String>,
    #[serde(rename = "firstName", skip_serializing_if = "Option::is_none")]
    _first_name: Option<String>,
    #[serde(rename = "lastName", skip_serializing_if = "Option::is_none")]
    _last_name: Option<String>,
    #[serde(rename = "avatar", skip_serializing_if = "Option::is_none")]
    _avatar: Option<String>,
    #[serde(rename = "name", skip_serializing_if = "Option::is_none")]
    _name: Option<String>,
    #[serde(rename = "anonymous", skip_serializing_if = "Option::is_none")]
    _anonymous: Option<bool>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    custom: HashMap<String, AttributeValue>,
}

fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    T: Default + Deserialize<'de>,
    D: Deserializer<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// Error type returned when setting a built-in attribute to a value of the wrong type.
#[derive(Debug)]
pub struct TypeError {
    key: &'static str,
    expected_type: &'static str,
    actual_type: &'static str,
}

impl TypeError {
    fn new(key: &'static str, expected_type: &'static str, actual_value: &AttributeValue) -> Self {
        TypeError {
            key,
            expected_type,
            actual_type: match actual_value {
                AttributeValue::Array(_) => "Array",
                AttributeValue::Bool(_) => "Bool",
                AttributeValue::Int(_) => "Int",
                AttributeValue::Float(_) => "Float",
                AttributeValue::Object(_) => "Object",
                AttributeValue::Null => "Null",
                AttributeValue::String(_) => "String",
            },
        }
    }
}

impl std::fmt::Display for TypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Attribute {} must be {}, not {}",
            self.key, self.expected_type, self.actual_type
        )
    }
}

impl std::error::Error for TypeError {}

impl User {
    /// Returns a builder for constructing a user with the given key.
    pub fn with_key(key: impl Into<String>) -> UserBuilder {
        UserBuilder::new(key)
    }

    pub fn key(&self) -> &str {
        &self._key
    }
    pub fn secondary(&self) -> Option<&str> {
        self._secondary.as_deref()
    }
    pub fn ip(&self) -> Option<&str> {
        self._ip.as_deref()
    }
    pub fn country(&self) -> Option<&str> {
        self._country.as_deref()
    }
    pub fn email(&self) -> Option<&str> {
        self._email.as_deref()
    }
    pub fn first_name(&self) -> Option<&str> {
        self._first_name.as_deref()
    }
    pub fn last_name(&self) -> Option<&str> {
        self._last_name.as_deref()
    }
    pub fn avatar(&self) -> Option<&str> {
        self._avatar.as_deref()
    }
    pub fn name(&self) -> Option<&str> {
        self._name.as_deref()
    }
    pub fn anonymous(&self) -> Option<bool> {
        self._anonymous
    }

    /// Look up an attribute by name. The ten built-in attributes shadow the custom map.
    pub fn value_of(&self, attr: &str) -> Option<AttributeValue> {
        match attr {
            "key" => Some(AttributeValue::String(self._key.clone())),
            "secondary" => self._secondary.as_deref().map(AttributeValue::from),
            "ip" => self._ip.as_deref().map(AttributeValue::from),
            "country" => self._country.as_deref().map(AttributeValue::from),
            "email" => self._email.as_deref().map(AttributeValue::from),
            "firstName" => self._first_name.as_deref().map(AttributeValue::from),
            "lastName" => self._last_name.as_deref().map(AttributeValue::from),
            "avatar" => self._avatar.as_deref().map(AttributeValue::from),
            "name" => self._name.as_deref().map(AttributeValue::from),
            "anonymous" => self._anonymous.map(AttributeValue::from),
            _ => self.custom.get(attr).cloned(),
        }
    }

    /// Set an attribute by name, built-in or custom. Built-in attributes reject values of the
    /// wrong type.
    pub fn attribute<T: Into<AttributeValue>>(
        &mut self,
        key: &str,
        value: T,
    ) -> Result<(), TypeError> {
        let value: AttributeValue = value.into();
        match key {
            "key" => {
                self._key = value
                    .as_str()
                    .ok_or_else(|| TypeError::new("key", "String", &value))?
                    .to_string()
            }
            "secondary" => self._secondary = Some(expect_string("secondary", value)?),
            "ip" => self._ip = Some(expect_string("ip", value)?),
            "country" => self._country = Some(expect_string("country", value)?),
            "email" => self._email = Some(expect_string("email", value)?),
            "firstName" => self._first_name = Some(expect_string("firstName", value)?),
            "lastName" => self._last_name = Some(expect_string("lastName", value)?),
            "avatar" => self._avatar = Some(expect_string("avatar", value)?),
            "name" => self._name = Some(expect_string("name", value)?),
            "anonymous" => {
                self._anonymous = Some(
                    value
                        .as_bool()
                        .ok_or_else(|| TypeError::new("anonymous", "Bool", &value))?,
                )
            }
            _ => {
                let _ = self.custom.insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    /// Compute this user's rollout bucket as a fraction in [0, 1).
    ///
    /// The bucket is a pure function of the bucketing attribute (default `key`), the secondary
    /// key if present, and the prefix (flag key and salt, or experiment seed). An attribute that
    /// is missing or not bucketable lands in bucket 0.
    pub fn bucket(&self, by_attr: Option<&str>, prefix: BucketPrefix) -> f32 {
        let attr_value = match by_attr {
            Some(attr) => self.value_of(attr),
            None => Some(AttributeValue::String(self._key.clone())),
        };
        self._bucket(attr_value.as_ref(), prefix).unwrap_or(0.0)
    }

    fn _bucket(&self, attr_value: Option<&AttributeValue>, prefix: BucketPrefix) -> Option<f32> {
        let mut id = attr_value?.as_bucketable()?;

        if let Some(secondary) = self.secondary() {
            id.push('.');
            id.push_str(secondary);
        }

        let mut input = String::with_capacity(64);
        prefix.write_hash_input(&mut input);
        input.push('.');
        input.push_str(&id);

        let hexhash = hex::encode(Sha1::digest(input.as_bytes()));

        // 15 hex digits = 60 bits, so the parse cannot overflow an i64
        let numhash = i64::from_str_radix(&hexhash[..15], 16).unwrap();

        Some(numhash as f32 / BUCKET_SCALE)
    }
}

/// Builder for [User]. All attributes other than the key are optional.
pub struct UserBuilder {
    key: String,
    secondary: Option<String>,
    ip: Option<String>,
    country: Option<String>,
    email: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    avatar: Option<String>,
    name: Option<String>,
    anonymous: Option<bool>,
    custom: HashMap<String, AttributeValue>,
}

fn expect_string(key: &'static str, value: AttributeValue) -> Result<String, TypeError> {
    value
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| TypeError::new(key, "String", &value))
}

impl UserBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secondary: None,
            ip: None,
            country: None,
            email: None,
            first_name: None,
            last_name: None,
            avatar: None,
            name: None,
            anonymous: None,
            custom: HashMap::with_capacity(USER_CUSTOM_STARTING_CAPACITY),
        }
    }

    pub fn secondary(&mut self, secondary: impl Into<String>) -> &Self {
        self.secondary = Some(secondary.into());
        self
    }
    pub fn ip(&mut self, ip: impl Into<String>) -> &Self {
        self.ip = Some(ip.into());
        self
    }
    pub fn country(&mut self, country: impl Into<String>) -> &Self {
        self.country = Some(country.into());
        self
    }

    pub fn email(&mut self, email: impl Into<String>) -> &Self {
        self.email = Some(email.into());
        self
    }

    pub fn first_name(&mut self, first_name: impl Into<String>) -> &Self {
        self.first_name = Some(first_name.into());
        self
    }
    pub fn last_name(&mut self, last_name: impl Into<String>) -> &Self {
        self.last_name = Some(last_name.into());
        self
    }
    pub fn avatar(&mut self, avatar: impl Into<String>) -> &Self {
        self.avatar = Some(avatar.into());
        self
    }

    pub fn name(&mut self, name: impl Into<String>) -> &Self {
        self.name = Some(name.into());
        self
    }

    pub fn anonymous(&mut self, anonymous: bool) -> &Self {
        self.anonymous = Some(anonymous);
        self
    }

    pub fn custom(&mut self, custom: HashMap<String, AttributeValue>) -> &Self {
        self.custom.extend(custom);
        self
    }

    pub fn build(&self) -> User {
        User {
            _key: self.key.clone(),
            _secondary: self.secondary.clone(),
            _ip: self.ip.clone(),
            _country: self.country.clone(),
            _email: self.email.clone(),
            _first_name: self.first_name.clone(),
            _last_name: self.last_name.clone(),
            _avatar: self.avatar.clone(),
            _name: self.name.clone(),
            _anonymous: self.anonymous,
            custom: self.custom.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use maplit::hashmap;
    use spectral::prelude::*;

    const BUCKET_TOLERANCE: f32 = 0.0000001;

    #[test]
    fn bucket_user_by_key() {
        let prefix = BucketPrefix::KeyAndSalt("hashKey", "saltyA");

        let user = User::with_key("userKeyA").build();
        let bucket = user.bucket(None, prefix);
        assert_that!(bucket).is_close_to(0.42157587, BUCKET_TOLERANCE);

        let user = User::with_key("userKeyB").build();
        let bucket = user.bucket(None, prefix);
        assert_that!(bucket).is_close_to(0.6708485, BUCKET_TOLERANCE);

        let user = User::with_key("userKeyC").build();
        let bucket = user.bucket(None, prefix);
        assert_that!(bucket).is_close_to(0.10343106, BUCKET_TOLERANCE);
    }

    #[test]
    fn bucket_user_with_seed() {
        let prefix = BucketPrefix::Seed(61);

        // distribution checked against the experiment fixtures: A lands in the first tenth,
        // B in the next fifth, C in the remainder
        let bucket_a = User::with_key("userKeyA").build().bucket(None, prefix);
        let bucket_b = User::with_key("userKeyB").build().bucket(None, prefix);
        let bucket_c = User::with_key("userKeyC").build().bucket(None, prefix);
        assert!(bucket_a < 0.1);
        assert!((0.1..0.3).contains(&bucket_b));
        assert!(bucket_c >= 0.3);

        // the seed replaces key and salt entirely
        let user_a = User::with_key("userKeyA").build();
        let with_salt = user_a.bucket(None, BucketPrefix::KeyAndSalt("hashKey", "saltyA"));
        assert_ne!(bucket_a, with_salt);

        // deterministic for identical inputs
        assert_eq!(bucket_a, User::with_key("userKeyA").build().bucket(None, prefix));
    }

    #[test]
    fn bucket_user_by_int_attr() {
        const USER_KEY: &str = "userKeyD";
        let prefix = BucketPrefix::KeyAndSalt("hashKey", "saltyA");

        let custom = hashmap! {
            "intAttr".into() => 33333.into(),
        };
        let user = User::with_key(USER_KEY).custom(custom).build();
        let bucket = user.bucket(Some("intAttr"), prefix);
        assert_that!(bucket).is_close_to(0.54771423, BUCKET_TOLERANCE);

        let custom = hashmap! {
            "stringAttr".into() => "33333".into(),
        };
        let user = User::with_key(USER_KEY).custom(custom).build();
        let bucket2 = user.bucket(Some("stringAttr"), prefix);
        assert_that!(bucket).is_close_to(bucket2, BUCKET_TOLERANCE);
    }

    #[test]
    fn bucket_user_by_float_attr_not_allowed() {
        const USER_KEY: &str = "userKeyE";
        let custom = hashmap! {
            "floatAttr".into() => 999.999.into(),
        };
        let user = User::with_key(USER_KEY).custom(custom).build();
        let bucket = user.bucket(
            Some("floatAttr"),
            BucketPrefix::KeyAndSalt("hashKey", "saltyA"),
        );
        assert_that!(bucket).is_close_to(0.0, BUCKET_TOLERANCE);
    }

    #[test]
    fn secondary_key_changes_bucket() {
        let prefix = BucketPrefix::KeyAndSalt("hashKey", "saltyA");
        let plain = User::with_key("userKeyA").build();
        let with_secondary = User::with_key("userKeyA").secondary("s").build();
        assert_ne!(plain.bucket(None, prefix), with_secondary.bucket(None, prefix));
    }

    #[test]
    fn parse_user_rejects_missing_key() {
        let result: serde_json::Result<User> = serde_json::from_str(r"{}");
        assert_that!(result).is_err();
    }

    #[test]
    fn parse_user_rejects_null_key() {
        let result: serde_json::Result<User> = serde_json::from_str(r#"{"key": null}"#);
        assert_that!(result).is_err();
    }

    #[test]
    fn null_custom_is_default() {
        let user1: User = serde_json::from_str(r#"{"key": "foo"}"#).unwrap();
        assert_eq!(user1.custom, hashmap![]);

        let user2: User = serde_json::from_str(r#"{"key": "foo", "custom": null}"#).unwrap();
        assert_eq!(user2.custom, hashmap![]);
    }

    #[test]
    fn custom_object_attribute_parses() {
        let user: User =
            serde_json::from_str(r#"{"key": "foo", "custom": {"detail": {"plan": "pro"}}}"#)
                .unwrap();
        assert_eq!(
            user.value_of("detail"),
            Some(AttributeValue::Object(
                hashmap! {"plan".to_string() => AttributeValue::String("pro".to_string())}
            ))
        );
    }

    #[test]
    fn user_attribute() {
        let mut user = User::with_key("abc").build();

        for attribute in vec![
            "key",
            "secondary",
            "ip",
            "country",
            "email",
            "firstName",
            "lastName",
            "avatar",
            "name",
        ] {
            user.attribute(attribute, "123").unwrap();
            user.attribute(attribute, 123).unwrap_err();
        }

        user.attribute("anonymous", true).unwrap();
        user.attribute("anonymous", 123).unwrap_err();
        user.attribute("custom", "123").unwrap();
        user.attribute("custom", 123).unwrap();
    }
}
