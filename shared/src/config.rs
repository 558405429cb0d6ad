use crate::TtlSecs;
use tracing::warn;

/// Where the MongoDB deployment lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Uri(String),
    HostPort { host: String, port: u16 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MongoSettings {
    pub endpoint: Endpoint,
    pub database: String,
    pub collection: String,
}

/// Settings for the source image storage keyed by request path
#[derive(Clone, Debug)]
pub struct PathStorageConfig {
    pub mongo: MongoSettings,
    pub expiration: TtlSecs,
    pub stores_crypto_key_for_each_image: bool,
    pub security_key: Option<String>,
    pub ignore_errors: bool,
}

/// Settings for the rendered result storage keyed by request url
#[derive(Clone, Debug)]
pub struct ResultStorageConfig {
    pub mongo: MongoSettings,
    pub expiration: TtlSecs,
    pub stores_metadata: bool,
    pub auto_webp: bool,
    pub ignore_errors: bool,
}

#[derive(Clone, Debug)]
pub struct SweepConfig {
    pub grace_seconds: u64,
    pub dry_run: bool,
}

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 27017;
const DEFAULT_DATABASE: &str = "thumbor";

impl PathStorageConfig {
    const DEFAULT_COLLECTION: &str = "images";
    const DEFAULT_EXPIRATION_SECONDS: u64 = 60 * 60 * 24 * 30;

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let security_key = lookup("SECURITY_KEY").filter(|key| !key.is_empty());

        Self {
            mongo: mongo_settings(&lookup, "MONGO_STORAGE", Self::DEFAULT_COLLECTION),
            expiration: TtlSecs(parse_or(
                &lookup,
                "STORAGE_EXPIRATION_SECONDS",
                Self::DEFAULT_EXPIRATION_SECONDS,
            )),
            stores_crypto_key_for_each_image: flag(&lookup, "STORES_CRYPTO_KEY_FOR_EACH_IMAGE", false),
            security_key,
            ignore_errors: flag(&lookup, "MONGO_STORAGE_IGNORE_ERRORS", true),
        }
    }
}

impl ResultStorageConfig {
    const DEFAULT_COLLECTION: &str = "results";

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            mongo: mongo_settings(&lookup, "MONGO_RESULT_STORAGE", Self::DEFAULT_COLLECTION),
            expiration: TtlSecs(parse_or(&lookup, "RESULT_STORAGE_EXPIRATION_SECONDS", 0)),
            stores_metadata: flag(&lookup, "RESULT_STORAGE_STORES_METADATA", false),
            auto_webp: flag(&lookup, "AUTO_WEBP", false),
            ignore_errors: flag(&lookup, "MONGO_RESULT_STORAGE_IGNORE_ERRORS", true),
        }
    }
}

impl SweepConfig {
    const DEFAULT_GRACE_SECONDS: u64 = 3600;

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            grace_seconds: parse_or(&lookup, "SWEEP_GRACE_SECONDS", Self::DEFAULT_GRACE_SECONDS),
            dry_run: flag(&lookup, "SWEEP_DRY_RUN", false),
        }
    }
}

impl Endpoint {
    /// Human readable target for logs. Credentials in a URI are not printed.
    pub fn describe(&self) -> String {
        match self {
            Endpoint::Uri(uri) => match (uri.split_once("://"), uri.rsplit_once('@')) {
                (Some((scheme, _)), Some((_, rest))) => format!("{}://***@{}", scheme, rest),
                _ => uri.clone(),
            },
            Endpoint::HostPort { host, port } => format!("{}:{}", host, port),
        }
    }
}

fn mongo_settings(
    lookup: &impl Fn(&str) -> Option<String>,
    prefix: &str,
    default_collection: &str,
) -> MongoSettings {
    let endpoint = match lookup(&format!("{prefix}_URI")).filter(|uri| !uri.is_empty()) {
        Some(uri) => Endpoint::Uri(uri),
        None => Endpoint::HostPort {
            host: lookup(&format!("{prefix}_SERVER_HOST"))
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_or(lookup, &format!("{prefix}_SERVER_PORT"), DEFAULT_PORT),
        },
    };

    MongoSettings {
        endpoint,
        database: lookup(&format!("{prefix}_SERVER_DB"))
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
        collection: lookup(&format!("{prefix}_SERVER_COLLECTION"))
            .unwrap_or_else(|| default_collection.to_string()),
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", name, raw, default);
            default
        }),
        None => default,
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    match lookup(name).map(|raw| raw.trim().to_ascii_lowercase()) {
        Some(raw) => match raw.as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!("{} has invalid value '{}', using default {}", name, raw, default);
                default
            }
        },
        None => default,
    }
}
