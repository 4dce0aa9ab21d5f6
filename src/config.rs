use anyhow::{Context, Result};
use chrono::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use rusoto_core::{region::ParseRegionError, Region};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt::{self, Display, Formatter},
    path::PathBuf,
    str::FromStr,
};

/// Identity represents a cloud identity: either an AWS IAM ARN (i.e.
/// "arn:...") or a GCP ServiceAccount (i.e. "foo@bar.com"). The empty string
/// parses to the "none" identity, meaning ambient credentials should be used.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identity(Option<String>);

impl Identity {
    pub fn none() -> Self {
        Identity(None)
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl FromStr for Identity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Identity(None));
        }
        Ok(Identity(Some(s.to_owned())))
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(identity) => write!(f, "{identity}"),
            None => write!(f, "default identity"),
        }
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.0 {
            Some(identity) => serializer.serialize_str(identity),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(Identity(s.filter(|s| !s.is_empty())))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct S3Path {
    pub region: Region,
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum S3PathParseError {
    #[error("Not an S3 path")]
    NoPath,
    #[error(
        "S3 path must be in the format `s3://{{region}}/{{bucket name}}/{{optional key prefix}}`"
    )]
    InvalidFormat,
    #[error(transparent)]
    InvalidRegion(#[from] ParseRegionError),
}

impl S3Path {
    /// Returns `self`, possibly adding '/' at the end of the key to ensure it
    /// can be combined with another path as a directory prefix.
    pub fn ensure_directory_prefix(mut self) -> Self {
        if !self.key.is_empty() && !self.key.ends_with('/') {
            self.key.push('/');
        }
        self
    }
}

impl Display for S3Path {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "s3://{}/{}/{}",
            self.region.name(),
            self.bucket,
            self.key
        )
    }
}

impl FromStr for S3Path {
    type Err = S3PathParseError;

    fn from_str(s: &str) -> Result<Self, S3PathParseError> {
        let region_and_bucket = s.strip_prefix("s3://").ok_or(S3PathParseError::NoPath)?;

        // All we require is that the string contain a region and a bucket
        // name. Further validation of bucket names is left to Amazon servers.
        let mut components = region_and_bucket
            .splitn(3, '/')
            .take_while(|s| !s.is_empty());
        let region = Region::from_str(components.next().ok_or(S3PathParseError::InvalidFormat)?)?;
        let bucket = components
            .next()
            .ok_or(S3PathParseError::InvalidFormat)?
            .to_owned();
        let key = components.next().map(|s| s.to_owned()).unwrap_or_default();
        // splitn will only return 3 so it should never have more
        assert!(components.next().is_none());

        Ok(S3Path {
            region,
            bucket,
            key,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GcsPath {
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GcsPathParseError {
    #[error("Not a gcs path")]
    NoPath,
    #[error("GCS path must be in the format `gs://{{bucket name}}/{{optional key prefix}}`")]
    InvalidFormat,
}

impl GcsPath {
    /// Returns `self`, possibly adding '/' at the end of the key to ensure it
    /// can be combined with another path as a directory prefix.
    pub fn ensure_directory_prefix(mut self) -> Self {
        if !self.key.is_empty() && !self.key.ends_with('/') {
            self.key.push('/');
        }
        self
    }
}

impl Display for GcsPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.key)
    }
}

impl FromStr for GcsPath {
    type Err = GcsPathParseError;

    fn from_str(s: &str) -> Result<Self, GcsPathParseError> {
        let bucket_and_prefix = s.strip_prefix("gs://").ok_or(GcsPathParseError::NoPath)?;

        let mut components = bucket_and_prefix
            .splitn(2, '/')
            .take_while(|s| !s.is_empty());
        let bucket = components
            .next()
            .ok_or(GcsPathParseError::InvalidFormat)?
            .to_owned();
        let key = components.next().map(|s| s.to_owned()).unwrap_or_default();
        assert!(components.next().is_none());

        Ok(GcsPath { bucket, key })
    }
}

/// A storage path is a cloud object store bucket (possibly with a key
/// prefix), or a local directory.
#[derive(Clone, Debug, PartialEq)]
pub enum StoragePath {
    GcsPath(GcsPath),
    S3Path(S3Path),
    LocalPath(PathBuf),
}

impl FromStr for StoragePath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<StoragePath> {
        match S3Path::from_str(s) {
            Err(S3PathParseError::NoPath) => {}
            p => return Ok(StoragePath::S3Path(p.context("parsing an S3 path")?)),
        }

        match GcsPath::from_str(s) {
            Err(GcsPathParseError::NoPath) => {}
            p => return Ok(StoragePath::GcsPath(p.context("parsing a GCS path")?)),
        }

        Ok(StoragePath::LocalPath(s.into()))
    }
}

impl Display for StoragePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoragePath::GcsPath(path) => path.fmt(f),
            StoragePath::S3Path(path) => path.fmt(f),
            StoragePath::LocalPath(path) => write!(f, "{}", path.display()),
        }
    }
}

impl<'de> Deserialize<'de> for StoragePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl Serialize for StoragePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Represents a simple duration specified in terms of whole days, hours,
/// minutes and seconds. Mostly used for user input in flags. For computations
/// it should usually be converted to a [`chrono::Duration`] using
/// [`to_duration`](SimpleDuration::to_duration).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SimpleDuration {
    days: u32,
    hours: u32,
    minutes: u32,
    seconds: u32,
}

impl SimpleDuration {
    pub fn from_dhms(days: u32, hours: u32, minutes: u32, seconds: u32) -> SimpleDuration {
        SimpleDuration {
            days,
            hours,
            minutes,
            seconds,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        // Components aren't allowed to overflow unless they're the first
        // non-0 component
        if self.days != 0 && self.hours >= 24 {
            return Err("hours > 23 are not allowed if days is specified".into());
        }
        if (self.days != 0 || self.hours != 0) && self.minutes >= 60 {
            return Err("minutes > 59 are not allowed if days or hours are specified".into());
        }
        if (self.days != 0 || self.hours != 0 || self.minutes != 0) && self.seconds >= 60 {
            return Err(
                "seconds > 59 are not allowed if days, hours or minutes are specified".into(),
            );
        }
        Ok(())
    }

    pub fn to_duration(&self) -> Duration {
        Duration::days(self.days.into())
            + Duration::hours(self.hours.into())
            + Duration::minutes(self.minutes.into())
            + Duration::seconds(self.seconds.into())
    }
}

impl From<SimpleDuration> for Duration {
    fn from(d: SimpleDuration) -> Duration {
        d.to_duration()
    }
}

impl Display for SimpleDuration {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if self.days != 0 {
            write!(f, "{}d", self.days)?;
        }
        if self.hours != 0 {
            write!(f, "{}h", self.hours)?;
        }
        if self.minutes != 0 {
            write!(f, "{}m", self.minutes)?;
        }
        if self.seconds != 0 || (self.days == 0 && self.hours == 0 && self.minutes == 0) {
            write!(f, "{}s", self.seconds)?;
        }
        Ok(())
    }
}

impl FromStr for SimpleDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<SimpleDuration, String> {
        static RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^(?:(\d+)d)?(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").unwrap());

        let groups = RE
            .captures(s)
            .ok_or("not in expected format (e.g. 90d or 1h30m20s)")?;

        let parse_component = |group_idx, label| -> Result<u32, String> {
            groups
                .get(group_idx)
                .map_or(Ok(0), |x| u32::from_str(x.as_str()))
                .map_err(|e| format!("failed to parse {label}: {e}"))
        };

        let d = SimpleDuration {
            days: parse_component(1, "days")?,
            hours: parse_component(2, "hours")?,
            minutes: parse_component(3, "minutes")?,
            seconds: parse_component(4, "seconds")?,
        };
        d.validate()?;
        Ok(d)
    }
}

impl Serialize for SimpleDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SimpleDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<SimpleDuration, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}
