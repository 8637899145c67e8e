//! Serde helpers for snowflake ids.
//!
//! Ids are written as decimal strings so 64-bit values survive JavaScript
//! clients. Both strings and bare integers are accepted on input.

use serde::{de, Deserialize, Deserializer, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Str(String),
    Int(i64),
}

fn parse<E: de::Error>(raw: RawId) -> Result<i64, E> {
    match raw {
        RawId::Int(v) => Ok(v),
        RawId::Str(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| E::custom(format!("invalid id '{s}'"))),
    }
}

pub fn serialize<S: Serializer>(id: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(id)
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    parse(RawId::deserialize(deserializer)?)
}

pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(id: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
        match id {
            Some(v) => serializer.collect_str(v),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<i64>, D::Error> {
        Option::<RawId>::deserialize(deserializer)?
            .map(parse)
            .transpose()
    }
}

pub mod vec {
    use super::*;
    use serde::ser::SerializeSeq;

    pub fn serialize<S: Serializer>(ids: &[i64], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(ids.len()))?;
        for id in ids {
            seq.serialize_element(&id.to_string())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<i64>, D::Error> {
        Vec::<RawId>::deserialize(deserializer)?
            .into_iter()
            .map(parse)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wrapped {
        #[serde(with = "super")]
        id: i64,
        #[serde(with = "super::option", default)]
        other: Option<i64>,
        #[serde(with = "super::vec", default)]
        many: Vec<i64>,
    }

    #[test]
    fn accepts_strings_and_numbers() {
        let wrapped: Wrapped =
            serde_json::from_str(r#"{"id":"42","other":7,"many":["1",2]}"#).unwrap();
        assert_eq!(
            wrapped,
            Wrapped {
                id: 42,
                other: Some(7),
                many: vec![1, 2]
            }
        );
    }

    #[test]
    fn writes_strings() {
        let json = serde_json::to_value(Wrapped {
            id: 9_007_199_254_740_993,
            other: None,
            many: vec![5],
        })
        .unwrap();
        assert_eq!(json["id"], "9007199254740993");
        assert!(json["other"].is_null());
        assert_eq!(json["many"][0], "5");
    }

    #[test]
    fn rejects_garbage() {
        assert!(serde_json::from_str::<Wrapped>(r#"{"id":"abc"}"#).is_err());
    }
}
