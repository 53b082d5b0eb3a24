//! Named key/value serializers.
//!
//! Wire messages carry serializer *names*; slaves resolve them through the
//! user program (which can add its own) or fall back to the built-ins:
//! `raw` (identity), `str` (UTF-8), and `int` (canonical decimal ASCII).
//! Serializers run at the bucket boundary: `dumps` on write, `loads` on read.

use std::fmt;
use std::sync::Arc;

use crate::error::MrResult;

type Convert = Arc<dyn Fn(&[u8]) -> MrResult<Vec<u8>> + Send + Sync>;

#[derive(Clone)]
pub struct Serializer {
    name: String,
    dumps: Convert,
    loads: Convert,
}

impl Serializer {
    pub fn new(
        name: impl Into<String>,
        dumps: impl Fn(&[u8]) -> MrResult<Vec<u8>> + Send + Sync + 'static,
        loads: impl Fn(&[u8]) -> MrResult<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), dumps: Arc::new(dumps), loads: Arc::new(loads) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dumps(&self, raw: &[u8]) -> MrResult<Vec<u8>> {
        (self.dumps)(raw)
    }

    pub fn loads(&self, raw: &[u8]) -> MrResult<Vec<u8>> {
        (self.loads)(raw)
    }
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer").field("name", &self.name).finish_non_exhaustive()
    }
}

pub fn raw() -> Serializer {
    Serializer::new("raw", |b| Ok(b.to_vec()), |b| Ok(b.to_vec()))
}

pub fn utf8() -> Serializer {
    fn check(bytes: &[u8]) -> MrResult<Vec<u8>> {
        std::str::from_utf8(bytes).map_err(|err| eyre!("invalid utf-8: {err}"))?;
        Ok(bytes.to_vec())
    }
    Serializer::new("str", check, check)
}

/// Canonicalizes signed decimal integers; rejects anything unparseable.
pub fn int() -> Serializer {
    fn canon(bytes: &[u8]) -> MrResult<Vec<u8>> {
        let text = std::str::from_utf8(bytes).map_err(|err| eyre!("invalid utf-8: {err}"))?;
        let n: i64 = text.trim().parse().map_err(|err| eyre!("invalid integer: {err}"))?;
        Ok(n.to_string().into_bytes())
    }
    Serializer::new("int", canon, canon)
}

pub fn builtin(name: &str) -> Option<Serializer> {
    match name {
        "raw" => Some(raw()),
        "str" => Some(utf8()),
        "int" => Some(int()),
        _ => None,
    }
}
