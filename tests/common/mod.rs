//! In-memory catalog site used by the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use bookwatch::fetcher::{BookSource, FetchError};
use bookwatch::models::{Availability, Book, BookStatus};

pub const PAGE_SIZE: usize = 4;

/// Fake upstream site: books keyed by URL, paginated in URL order.
#[derive(Default)]
pub struct FakeSite {
    books: Mutex<BTreeMap<String, Book>>,
    gone: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    pub fetched_pages: Mutex<Vec<u32>>,
    pub fetched_books: Mutex<Vec<String>>,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(index: usize) -> String {
        format!("https://books.example/catalogue/book-{index:03}/index.html")
    }

    pub fn add_book(&self, book: Book) {
        self.books.lock().unwrap().insert(book.source_url.clone(), book);
    }

    pub fn seed(&self, count: usize) {
        for index in 0..count {
            self.add_book(make_book(index));
        }
    }

    /// Change the displayed price only; every other field stays identical.
    pub fn set_price(&self, url: &str, price: &str) {
        let mut books = self.books.lock().unwrap();
        let book = books.get_mut(url).expect("unknown url");
        book.price_including_tax = Decimal::from_str(price).unwrap();
    }

    /// Book detail pages start returning terminal 404 and the catalog stops
    /// listing the URL.
    pub fn remove(&self, url: &str) {
        self.gone.lock().unwrap().insert(url.to_string());
        self.books.lock().unwrap().remove(url);
    }

    /// Book detail pages fail with exhausted retries.
    pub fn fail(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    fn urls_in_order(&self) -> Vec<String> {
        self.books.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl BookSource for FakeSite {
    async fn fetch_book(&self, url: &str) -> Result<Book, FetchError> {
        self.fetched_books.lock().unwrap().push(url.to_string());
        if self.gone.lock().unwrap().contains(url) {
            return Err(FetchError::NotFound(url.to_string()));
        }
        if self.failing.lock().unwrap().contains(url) {
            return Err(FetchError::RetriesExhausted {
                url: url.to_string(),
                attempts: 4,
                last_error: "connection refused".to_string(),
            });
        }
        self.books
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(url.to_string()))
    }

    async fn fetch_catalog_page(&self, page: u32) -> Result<Vec<String>, FetchError> {
        self.fetched_pages.lock().unwrap().push(page);
        let urls = self.urls_in_order();
        let start = (page as usize - 1) * PAGE_SIZE;
        Ok(urls.into_iter().skip(start).take(PAGE_SIZE).collect())
    }

    async fn count_pages(&self) -> Result<u32, FetchError> {
        let count = self.books.lock().unwrap().len();
        Ok(((count + PAGE_SIZE - 1) / PAGE_SIZE).max(1) as u32)
    }
}

pub fn make_book(index: usize) -> Book {
    let now = Utc::now();
    Book {
        name: format!("Book {index:03}"),
        description: format!("Description of book {index}."),
        category: if index % 2 == 0 { "Fiction" } else { "Poetry" }.to_string(),
        price_including_tax: Decimal::from_str("19.99").unwrap(),
        price_excluding_tax: Decimal::from_str("19.99").unwrap(),
        availability: Availability::InStock,
        rating: Some(((index % 5) + 1) as u8),
        number_of_reviews: index as u32,
        image_url: format!("https://books.example/media/book-{index:03}.jpg"),
        source_url: FakeSite::url(index),
        status: BookStatus::Active,
        created_at: now,
        updated_at: now,
        last_crawled_at: now,
    }
}
