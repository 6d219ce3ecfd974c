//! Purpose: Define the Book record, its identifier, and the textual edit form.
//! Exports: `Book`, `BookId`, `NewBook`, `BookForm`.
//! Role: Canonical schema enforced at every store boundary.
//! Invariants: The wire field is `introduction`; `intraduction` is accepted on decode only.
//! Invariants: `name` and `author` are non-blank; `count` is non-negative by type.
//! Invariants: A `Book` always carries an identifier; a `NewBook` never does.
use super::error::{Error, ErrorKind};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-assigned identifier: integer keys from SQL tables, text keys elsewhere.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BookId {
    Int(i64),
    Text(String),
}

impl fmt::Display for BookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookId::Int(value) => write!(f, "{value}"),
            BookId::Text(value) => f.write_str(value),
        }
    }
}

impl FromStr for BookId {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::new(ErrorKind::Validation).with_message("book id must not be empty"));
        }
        Ok(match trimmed.parse::<i64>() {
            Ok(value) => BookId::Int(value),
            Err(_) => BookId::Text(trimmed.to_string()),
        })
    }
}

impl From<i64> for BookId {
    fn from(value: i64) -> Self {
        BookId::Int(value)
    }
}

impl From<&str> for BookId {
    fn from(value: &str) -> Self {
        BookId::Text(value.to_string())
    }
}

/// Book fields before the store has assigned an identifier.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NewBook {
    pub name: String,
    pub author: String,
    #[serde(default, alias = "intraduction", deserialize_with = "null_as_default")]
    pub introduction: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub count: u64,
}

impl NewBook {
    pub fn new(name: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            author: author.into(),
            introduction: String::new(),
            count: 0,
        }
    }

    pub fn with_introduction(mut self, introduction: impl Into<String>) -> Self {
        self.introduction = introduction.into();
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::new(ErrorKind::Validation).with_message("book name is required"));
        }
        if self.author.trim().is_empty() {
            return Err(Error::new(ErrorKind::Validation).with_message("book author is required"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub name: String,
    pub author: String,
    #[serde(default, alias = "intraduction", deserialize_with = "null_as_default")]
    pub introduction: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub count: u64,
}

impl Book {
    pub fn from_new(id: BookId, fields: NewBook) -> Self {
        Self {
            id,
            name: fields.name,
            author: fields.author,
            introduction: fields.introduction,
            count: fields.count,
        }
    }

    /// Mutable fields only; the identifier never travels in an update body.
    pub fn fields(&self) -> NewBook {
        NewBook {
            name: self.name.clone(),
            author: self.author.clone(),
            introduction: self.introduction.clone(),
            count: self.count,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.fields().validate()
    }
}

/// Textual form input as a user types it; parsed into `NewBook` on submit.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BookForm {
    pub name: String,
    pub author: String,
    pub introduction: String,
    pub count: String,
}

impl BookForm {
    pub fn parse(&self) -> Result<NewBook, Error> {
        let count = parse_count(&self.count)?;
        let book = NewBook {
            name: self.name.trim().to_string(),
            author: self.author.trim().to_string(),
            introduction: self.introduction.clone(),
            count,
        };
        book.validate()?;
        Ok(book)
    }
}

impl From<&Book> for BookForm {
    fn from(book: &Book) -> Self {
        Self {
            name: book.name.clone(),
            author: book.author.clone(),
            introduction: book.introduction.clone(),
            count: book.count.to_string(),
        }
    }
}

fn parse_count(input: &str) -> Result<u64, Error> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed.parse::<u64>().map_err(|err| {
        Error::new(ErrorKind::Validation)
            .with_message(format!("count must be a non-negative integer, got {trimmed:?}"))
            .with_source(err)
    })
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
