// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Serde helpers for HeaderMap (de)serialization.
//!
//! Headers are stored as an ordered list of `(name, value)` pairs so that
//! repeated header names keep their relative order across a round-trip.
//! Values that are not valid UTF-8 are dropped during serialization.

use hyper::header::HeaderValue;
use hyper::HeaderMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub fn serialize_headers<S>(hm: &HeaderMap, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut pairs: Vec<(&str, &str)> = Vec::with_capacity(hm.len());
    for (name, value) in hm.iter() {
        if let Ok(s) = value.to_str() {
            pairs.push((name.as_str(), s));
        }
    }
    pairs.serialize(serializer)
}

pub fn deserialize_headers<'de, D>(deserializer: D) -> Result<HeaderMap, D::Error>
where
    D: Deserializer<'de>,
{
    let pairs = Vec::<(String, String)>::deserialize(deserializer)?;
    let mut hm = HeaderMap::new();
    for (k, v) in pairs {
        let name = k
            .parse::<hyper::header::HeaderName>()
            .map_err(serde::de::Error::custom)?;
        let val = v.parse::<HeaderValue>().map_err(serde::de::Error::custom)?;
        hm.append(name, val);
    }
    Ok(hm)
}
