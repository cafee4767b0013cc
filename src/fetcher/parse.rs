//! Tolerant HTML extraction for catalog and book detail pages.
//!
//! Extraction is field-scoped: a selector that matches nothing yields the
//! documented empty value (`""` for text, 0 for counts, out-of-stock for
//! availability, absent for rating) instead of failing the whole page.

use std::str::FromStr;
use std::sync::OnceLock;

use chrono::Utc;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};

use crate::models::{Availability, Book, BookStatus};

use super::FetchError;

struct Selectors {
    product_pod_link: Selector,
    next_control: Selector,
    name: Selector,
    description: Selector,
    breadcrumb_links: Selector,
    price_color: Selector,
    availability: Selector,
    info_rows: Selector,
    row_header: Selector,
    row_value: Selector,
    image: Selector,
    star_rating: Selector,
}

fn selectors() -> &'static Selectors {
    static SELECTORS: OnceLock<Selectors> = OnceLock::new();
    SELECTORS.get_or_init(|| Selectors {
        product_pod_link: Selector::parse("article.product_pod h3 a").expect("valid selector"),
        next_control: Selector::parse("li.next").expect("valid selector"),
        name: Selector::parse("div.product_main h1, h1").expect("valid selector"),
        description: Selector::parse("#product_description + p").expect("valid selector"),
        breadcrumb_links: Selector::parse("ul.breadcrumb li a").expect("valid selector"),
        price_color: Selector::parse("p.price_color").expect("valid selector"),
        availability: Selector::parse("p.availability").expect("valid selector"),
        info_rows: Selector::parse("table.table tr").expect("valid selector"),
        row_header: Selector::parse("th").expect("valid selector"),
        row_value: Selector::parse("td").expect("valid selector"),
        image: Selector::parse("div.item.active img, #product_gallery img").expect("valid selector"),
        star_rating: Selector::parse("p.star-rating").expect("valid selector"),
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn select_text(doc: &Html, selector: &Selector) -> String {
    doc.select(selector).next().map(element_text).unwrap_or_default()
}

/// Strip everything but digits and dots, then parse fixed-point. Malformed
/// prices yield zero; the store's invariants flag those rows downstream.
pub fn parse_price(text: &str) -> Decimal {
    let cleaned: String = text.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
    if cleaned.is_empty() {
        return Decimal::ZERO;
    }
    Decimal::from_str(&cleaned).unwrap_or(Decimal::ZERO)
}

pub fn parse_availability(text: &str) -> Availability {
    if text.to_lowercase().contains("in stock") {
        Availability::InStock
    } else {
        Availability::OutOfStock
    }
}

pub fn parse_review_count(text: &str) -> u32 {
    let digits: String = text.chars().skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

/// Map a `star-rating` class list ("One".."Five") to 1..=5.
pub fn parse_rating_classes<'a>(classes: impl Iterator<Item = &'a str>) -> Option<u8> {
    for class in classes {
        let rating = match class {
            c if c.starts_with("One") => Some(1),
            c if c.starts_with("Two") => Some(2),
            c if c.starts_with("Three") => Some(3),
            c if c.starts_with("Four") => Some(4),
            c if c.starts_with("Five") => Some(5),
            _ => None,
        };
        if rating.is_some() {
            return rating;
        }
    }
    None
}

/// Whether a catalog page advertises a following page.
pub fn has_next_control(html: &str) -> bool {
    let doc = Html::parse_document(html);
    doc.select(&selectors().next_control).next().is_some()
}

/// Absolute book URLs listed on one catalog page.
pub fn parse_catalog_page(html: &str, page_url: &str) -> Result<Vec<String>, FetchError> {
    let base = reqwest::Url::parse(page_url).map_err(|e| FetchError::Parse {
        url: page_url.to_string(),
        reason: e.to_string(),
    })?;

    let doc = Html::parse_document(html);
    let mut urls = Vec::new();
    for link in doc.select(&selectors().product_pod_link) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        if let Ok(absolute) = base.join(href) {
            urls.push(absolute.to_string());
        }
    }
    Ok(urls)
}

/// Look up a value cell in the product-information table by its row header.
fn info_table_value(doc: &Html, header: &str) -> String {
    let sel = selectors();
    for row in doc.select(&sel.info_rows) {
        let matches = row
            .select(&sel.row_header)
            .next()
            .map(|th| element_text(th) == header)
            .unwrap_or(false);
        if matches {
            if let Some(td) = row.select(&sel.row_value).next() {
                return element_text(td);
            }
        }
    }
    String::new()
}

/// Parse a book detail page into a fresh record.
pub fn parse_book_page(html: &str, source_url: &str) -> Result<Book, FetchError> {
    let base = reqwest::Url::parse(source_url).map_err(|e| FetchError::Parse {
        url: source_url.to_string(),
        reason: e.to_string(),
    })?;

    let doc = Html::parse_document(html);
    let sel = selectors();

    let name = select_text(&doc, &sel.name);
    let description = select_text(&doc, &sel.description);

    // Breadcrumb: Home > Books > <category> > <title>.
    let category = doc
        .select(&sel.breadcrumb_links)
        .nth(2)
        .map(element_text)
        .unwrap_or_default();

    let price_including_tax = parse_price(&select_text(&doc, &sel.price_color));
    let price_excluding_tax = {
        let from_table = info_table_value(&doc, "Price (excl. tax)");
        if from_table.is_empty() {
            price_including_tax
        } else {
            parse_price(&from_table)
        }
    };

    let availability_text = {
        let from_para = select_text(&doc, &sel.availability);
        if from_para.is_empty() {
            info_table_value(&doc, "Availability")
        } else {
            from_para
        }
    };
    let availability = parse_availability(&availability_text);

    let number_of_reviews = parse_review_count(&info_table_value(&doc, "Number of reviews"));

    let rating = doc
        .select(&sel.star_rating)
        .next()
        .and_then(|el| parse_rating_classes(el.value().classes()));

    let image_url = doc
        .select(&sel.image)
        .next()
        .and_then(|img| img.value().attr("src"))
        .and_then(|src| base.join(src).ok())
        .map(|u| u.to_string())
        .unwrap_or_default();

    let now = Utc::now();
    Ok(Book {
        name,
        description,
        category,
        price_including_tax,
        price_excluding_tax,
        availability,
        rating,
        number_of_reviews,
        image_url,
        source_url: source_url.to_string(),
        status: BookStatus::Active,
        created_at: now,
        updated_at: now,
        last_crawled_at: now,
    })
}
