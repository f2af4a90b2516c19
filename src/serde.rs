use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::de::{self, value::MapAccessDeserializer, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use void::{ResultVoidExt, Void};

/// Deserializes a value written either as a bare string, a mapping, or null.
/// https://serde.rs/string-or-struct.html
///
/// A machine's `auth` is a key path (`auth: ~/.ssh/id_rsa`), a mapping with
/// `key` and/or `password`, or left empty (`auth: ~`) for no credentials.
pub fn string_or_mapping<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: Deserialize<'de> + FromStr<Err = Void> + Default,
    D: Deserializer<'de>,
{
    struct StringOrMapping<T>(PhantomData<fn() -> T>);

    impl<'de, T> Visitor<'de> for StringOrMapping<T>
    where
        T: Deserialize<'de> + FromStr<Err = Void> + Default,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string, a mapping or nothing")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<T, E> {
            Ok(T::from_str(value).void_unwrap())
        }

        fn visit_unit<E: de::Error>(self) -> Result<T, E> {
            Ok(T::default())
        }

        fn visit_map<M: MapAccess<'de>>(self, map: M) -> Result<T, M::Error> {
            T::deserialize(MapAccessDeserializer::new(map))
        }
    }

    deserializer.deserialize_any(StringOrMapping(PhantomData))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq, Deserialize)]
    struct Target {
        path: Option<String>,
        secret: Option<String>,
    }

    impl FromStr for Target {
        type Err = Void;

        fn from_str(s: &str) -> Result<Self, Void> {
            Ok(Target {
                path: Some(s.to_string()),
                secret: None,
            })
        }
    }

    #[derive(Debug, Deserialize)]
    struct Holder {
        #[serde(default, deserialize_with = "string_or_mapping")]
        target: Target,
    }

    fn parse(yaml: &str) -> Target {
        serde_yaml::from_str::<Holder>(yaml).unwrap().target
    }

    #[test]
    fn test_string_mapping_and_null() {
        assert_eq!(parse("target: /keys/a").path.as_deref(), Some("/keys/a"));
        assert_eq!(
            parse("target: { secret: s }"),
            Target {
                path: None,
                secret: Some("s".to_string()),
            }
        );
        assert_eq!(parse("target: ~"), Target::default());
        assert_eq!(parse("{}"), Target::default());
    }

    #[test]
    fn test_list_is_rejected() {
        assert!(serde_yaml::from_str::<Holder>("target: [a, b]").is_err());
    }
}
