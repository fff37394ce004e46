//! LEGO Data Dictionary codec used by the client's `boot.cfg`.
//!
//! Entries look like `KEY=type:value` and are separated by commas. Only the
//! type codes found in boot files are understood.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::LddError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LddValue {
    String(String),
    Int(i32),
    UInt(u32),
    Bool(bool),
}

impl LddValue {
    pub fn type_code(&self) -> u8 {
        match self {
            Self::String(_) => 0,
            Self::Int(_) => 1,
            Self::UInt(_) => 5,
            Self::Bool(_) => 7,
        }
    }

    fn parse(entry: &str, code: u8, raw: &str) -> Result<Self, LddError> {
        let invalid = || LddError::InvalidValue {
            entry: entry.to_owned(),
            code,
        };
        match code {
            0 => Ok(Self::String(raw.to_owned())),
            1 => raw.parse().map(Self::Int).map_err(|_| invalid()),
            5 => raw.parse().map(Self::UInt).map_err(|_| invalid()),
            7 => match raw.parse::<i32>() {
                Ok(value) => Ok(Self::Bool(value == 1)),
                Err(_) => match raw.to_ascii_lowercase().as_str() {
                    "true" => Ok(Self::Bool(true)),
                    "false" => Ok(Self::Bool(false)),
                    _ => Err(invalid()),
                },
            },
            _ => Err(LddError::UnknownType {
                entry: entry.to_owned(),
                code: code.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for LddValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(value) => f.write_str(value),
            Self::Int(value) => write!(f, "{value}"),
            Self::UInt(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{}", u8::from(*value)),
        }
    }
}

impl From<&str> for LddValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for LddValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i32> for LddValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for LddValue {
    fn from(value: u32) -> Self {
        Self::UInt(value)
    }
}

impl From<bool> for LddValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Ordered key/value store. Keys keep the position of their first insertion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LegoDataDictionary {
    entries: Vec<(String, LddValue)>,
}

impl LegoDataDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_file(path: &Path) -> Result<Self, String> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        text.trim()
            .parse()
            .map_err(|e| format!("failed to parse {}: {e}", path.display()))
    }

    pub fn get(&self, key: &str) -> Option<&LddValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(LddValue::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<LddValue>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(existing, _)| existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key.to_owned(), value)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LddValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }
}

impl FromStr for LegoDataDictionary {
    type Err = LddError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut dictionary = Self::new();
        for entry in data.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (key, typed) = entry
                .split_once('=')
                .ok_or_else(|| LddError::MissingEquals(entry.to_owned()))?;
            let (code, raw) = typed
                .split_once(':')
                .ok_or_else(|| LddError::MissingType(entry.to_owned()))?;
            let code = code.parse::<u8>().map_err(|_| LddError::UnknownType {
                entry: entry.to_owned(),
                code: code.to_owned(),
            })?;
            let value = LddValue::parse(entry, code, raw)?;
            dictionary.set(key, value);
        }
        Ok(dictionary)
    }
}

impl fmt::Display for LegoDataDictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (key, value)) in self.entries.iter().enumerate() {
            if index > 0 {
                f.write_str(",\n")?;
            }
            write!(f, "{key}={}:{value}", value.type_code())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOT: &str = "SERVERNAME=0:Overbuild Universe (US),\n\
        PATCHSERVERIP=0:localhost,\n\
        AUTHSERVERIP=0:localhost,\n\
        PATCHSERVERPORT=1:80,\n\
        LOGGING=1:100,\n\
        DATACENTERID=5:150,\n\
        CPCODE=1:-1,\n\
        AKAMAIDLM=7:0,\n\
        PATCHSERVERDIR=0:luclient,\n\
        UGCUSE3DSERVICES=7:1,\n\
        UGCSERVERIP=0:localhost,\n\
        UGCSERVERDIR=0:3dservices,\n\
        PASSURL=0:https://account.lego.com/en-us/SendPassword.aspx?Username=,\n\
        SIGNINURL=0:https://account.lego.com/en-us/SignIn.aspx?ReturnUrl=http://universe.lego.com/en-us/myaccount/default.aspx,\n\
        SIGNUPURL=0:http://universe.lego.com/en-us/myaccount/registration/default.aspx,\n\
        REGISTERURL=0:https://secure.universe.lego.com/en-us/character/default.aspx,\n\
        CRASHLOGURL=0:http://services.lego.com/cls.aspx,\n\
        LOCALE=0:en_US,\n\
        TRACK_DSK_USAGE=7:0,\n\
        HD_SPACE_FREE=0:0,\n\
        HD_SPACE_TOTAL=0:0";

    #[test]
    fn parses_all_type_codes() {
        let ldd: LegoDataDictionary = BOOT.parse().unwrap();
        assert_eq!(ldd.get_str("AUTHSERVERIP"), Some("localhost"));
        assert_eq!(ldd.get("CPCODE"), Some(&LddValue::Int(-1)));
        assert_eq!(ldd.get("DATACENTERID"), Some(&LddValue::UInt(150)));
        assert_eq!(ldd.get("UGCUSE3DSERVICES"), Some(&LddValue::Bool(true)));
        assert_eq!(ldd.get("AKAMAIDLM"), Some(&LddValue::Bool(false)));
        // Values may contain `=` and `:`.
        assert!(ldd.get_str("SIGNINURL").unwrap().contains("ReturnUrl=http://"));
    }

    #[test]
    fn round_trips_entries() {
        let ldd: LegoDataDictionary = BOOT.parse().unwrap();
        let reparsed: LegoDataDictionary = ldd.to_string().parse().unwrap();
        assert_eq!(ldd, reparsed);
        assert_eq!(ldd.len(), 21);
    }

    #[test]
    fn writes_bools_as_digits() {
        let ldd: LegoDataDictionary = "A=7:true, B=7:False".parse().unwrap();
        assert_eq!(ldd.to_string(), "A=7:1,\nB=7:0");
    }

    #[test]
    fn set_replaces_in_place() {
        let mut ldd: LegoDataDictionary = "A=0:x,\nB=1:2".parse().unwrap();
        ldd.set("A", "y");
        ldd.set("C", true);
        assert_eq!(ldd.to_string(), "A=0:y,\nB=1:2,\nC=7:1");
    }

    #[test]
    fn rejects_malformed_entries() {
        assert_eq!(
            "A".parse::<LegoDataDictionary>(),
            Err(LddError::MissingEquals("A".into()))
        );
        assert_eq!(
            "A=x".parse::<LegoDataDictionary>(),
            Err(LddError::MissingType("A=x".into()))
        );
        assert!(matches!(
            "A=3:x".parse::<LegoDataDictionary>(),
            Err(LddError::UnknownType { .. })
        ));
        assert!(matches!(
            "A=1:abc".parse::<LegoDataDictionary>(),
            Err(LddError::InvalidValue { code: 1, .. })
        ));
        assert!(matches!(
            "A=7:maybe".parse::<LegoDataDictionary>(),
            Err(LddError::InvalidValue { code: 7, .. })
        ));
    }
}
