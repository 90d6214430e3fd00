//! Catalog records shared by the cache, the analytics pipeline and the source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity kinds known to the catalog core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Book,
    Member,
    Loan,
}

impl EntityKind {
    /// Upper-case tag used inside store keys (`SET_BOOK`, `..._ANALYTICS_MEMBER_3`)
    pub fn tag(&self) -> &'static str {
        match self {
            EntityKind::Book => "BOOK",
            EntityKind::Member => "MEMBER",
            EntityKind::Loan => "LOAN",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Book => write!(f, "book"),
            EntityKind::Member => write!(f, "member"),
            EntityKind::Loan => write!(f, "loan"),
        }
    }
}

/// A record owned by the source of truth and addressed by a numeric id.
pub trait Entity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> u64;

    /// Called by the source of truth when it assigns an id on create.
    fn set_id(&mut self, id: u64);

    /// Natural key that must be unique across the kind (ISBN, email).
    fn natural_key(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: u64,
    pub title: String,
    pub author: String,
    pub published_date: Option<DateTime<Utc>>,
    pub isbn: String,
    pub number_of_pages: u64,
    pub cover_image: String,
    pub language: String,
    pub available_copies: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Book {
    pub fn new(
        title: impl Into<String>,
        author: impl Into<String>,
        isbn: impl Into<String>,
    ) -> Self {
        Book {
            id: 0,
            title: title.into(),
            author: author.into(),
            published_date: None,
            isbn: isbn.into(),
            number_of_pages: 0,
            cover_image: String::new(),
            language: String::new(),
            available_copies: 0,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_copies(mut self, copies: i64) -> Self {
        self.available_copies = copies;
        self
    }
}

impl Entity for Book {
    const KIND: EntityKind = EntityKind::Book;

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn natural_key(&self) -> Option<&str> {
        Some(&self.isbn)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    pub name: String,
    pub email: String,
    pub join_date: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Member {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Member {
            id: 0,
            name: name.into(),
            email: email.into(),
            join_date: None,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for Member {
    const KIND: EntityKind = EntityKind::Member;

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn natural_key(&self) -> Option<&str> {
        Some(&self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: u64,
    pub book_id: u64,
    pub member_id: u64,
    pub loan_date: DateTime<Utc>,
    pub return_date: Option<DateTime<Utc>>,
}

impl Loan {
    pub fn new(book_id: u64, member_id: u64, loan_date: DateTime<Utc>) -> Self {
        Loan {
            id: 0,
            book_id,
            member_id,
            loan_date,
            return_date: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.return_date.is_some()
    }
}

impl Entity for Loan {
    const KIND: EntityKind = EntityKind::Loan;

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
}
