
use std::{fmt, ops};

use internment::Intern;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Symbol(Intern<String>);

impl From<&str> for Symbol {
    fn from(s: &str) -> Self { Symbol(Intern::from_ref(s)) }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self { Symbol(Intern::new(s)) }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &'static str { self.0.as_ref() }
}

impl ops::Deref for Symbol {
    type Target = String;
    fn deref(&self) -> &Self::Target { self.0.deref() }
}

impl Default for Symbol {
    fn default() -> Self { Self::from("_") }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_ref().fmt(f)
    }
}
