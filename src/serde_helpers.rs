//! Serde helpers for flexible deserialization.
//!
//! When the `tracing` feature is enabled, this module also logs warnings for any
//! unknown fields encountered during deserialization, helping detect API changes.

use std::fmt;

use serde::de::{self, DeserializeOwned, Visitor};
use serde_json::Value;

/// A `serde_as` type that deserializes a timetoken sent either as a decimal string or
/// as an integer.
///
/// Subscribe envelopes carry timetokens as strings while the time endpoint returns bare
/// numbers; both end up as `u64`.
pub struct TimetokenFromAny;

impl<'de> serde_with::DeserializeAs<'de, u64> for TimetokenFromAny {
    fn deserialize_as<D>(deserializer: D) -> std::result::Result<u64, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct TimetokenVisitor;

        impl Visitor<'_> for TimetokenVisitor {
            type Value = u64;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("timetoken as string or unsigned integer")
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E>(self, v: u64) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(v)
            }

            fn visit_i64<E>(self, v: i64) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                u64::try_from(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(TimetokenVisitor)
    }
}

/// Deserialize JSON with unknown field warnings.
///
/// Unknown fields trigger warnings but do not cause deserialization to fail.
#[cfg(feature = "tracing")]
pub fn deserialize_with_warnings<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    use std::any::type_name;

    tracing::trace!(
        type_name = %type_name::<T>(),
        json = %value,
        "deserializing JSON"
    );

    let original = value.clone();
    let mut unknown_paths: Vec<String> = Vec::new();

    let result: T = serde_ignored::deserialize(value, |path| {
        unknown_paths.push(path.to_string());
    })
    .inspect_err(|_| {
        let json_str = original.to_string();
        let jd = &mut serde_json::Deserializer::from_str(&json_str);
        let path_result: Result<T, _> = serde_path_to_error::deserialize(jd);
        if let Err(path_err) = path_result {
            let path = path_err.path().to_string();
            tracing::error!(
                type_name = %type_name::<T>(),
                path = %path,
                value = %format_value(lookup_value(&original, &path)),
                error = %path_err.inner(),
                "deserialization failed"
            );
        }
    })?;

    for path in unknown_paths {
        tracing::warn!(
            type_name = %type_name::<T>(),
            field = %path,
            value = %format_value(lookup_value(&original, &path)),
            "unknown field in API response"
        );
    }

    Ok(result)
}

/// Pass-through deserialization when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub fn deserialize_with_warnings<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Look up a value by a `serde_ignored`/`serde_path_to_error` path such as `m[0].d` or
/// `m.0.?.d`. `?` segments stand for `Option` wrappers and are skipped.
#[cfg(any(feature = "tracing", test))]
fn lookup_value<'value>(value: &'value Value, path: &str) -> Option<&'value Value> {
    path.split(['.', '[', ']'])
        .filter(|segment| !segment.is_empty() && *segment != "?")
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
            _ => None,
        })
}

#[cfg(any(feature = "tracing", test))]
fn format_value(value: Option<&Value>) -> String {
    value.map_or_else(|| "<unable to retrieve>".to_owned(), Value::to_string)
}
