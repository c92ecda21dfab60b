use std::fmt;

#[derive(Debug)]
pub struct Error {
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self { msg: msg.into() }
    }

    /// Failure of a named operation, keeping the underlying cause readable:
    /// `"swap activation: exit 255"`.
    pub fn ctx<M: Into<String>, C: fmt::Display>(op: M, cause: C) -> Self {
        Self {
            msg: format!("{}: {cause}", op.into()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctx_prefixes_the_operation() {
        let err = Error::ctx("swap activation", "exit 255");
        assert_eq!(err.to_string(), "swap activation: exit 255");
    }

    #[test]
    fn json_errors_convert() {
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = bad.into();
        assert!(!err.to_string().is_empty());
    }
}
