//! Book catalog lookups.
//!
//! The CLI resolves `--book <slug>` against this table before starting a
//! run. The catalog is seeded by the migrations; runs reference books by
//! slug only.

use bindery_types::error::RepositoryError;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::pool::DatabasePool;

/// One catalog entry.
#[derive(Debug, Clone)]
pub struct Book {
    pub slug: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Read-only access to the seeded book catalog.
pub struct SqliteBookCatalog {
    pool: DatabasePool,
}

impl SqliteBookCatalog {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub async fn get_book(&self, slug: &str) -> Result<Option<Book>, RepositoryError> {
        let row = sqlx::query("SELECT slug, title, created_at FROM books WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| book_from_row(&row)).transpose()
    }

    pub async fn list_books(&self) -> Result<Vec<Book>, RepositoryError> {
        let rows = sqlx::query("SELECT slug, title, created_at FROM books ORDER BY slug ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(book_from_row).collect()
    }
}

fn book_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Book, RepositoryError> {
    let slug: String = row
        .try_get("slug")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let title: String = row
        .try_get("title")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let created_at: String = row
        .try_get("created_at")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))?;

    Ok(Book {
        slug,
        title,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn catalog() -> SqliteBookCatalog {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("books.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = DatabasePool::new(&url).await.unwrap();
        std::mem::forget(dir);
        SqliteBookCatalog::new(pool)
    }

    #[tokio::test]
    async fn seeded_book_resolves() {
        let catalog = catalog().await;
        let book = catalog.get_book("book_core").await.unwrap().unwrap();
        assert_eq!(book.title, "The Core Handbook");
    }

    #[tokio::test]
    async fn unknown_slug_is_none() {
        let catalog = catalog().await;
        assert!(catalog.get_book("book_ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_is_sorted_by_slug() {
        let catalog = catalog().await;
        let books = catalog.list_books().await.unwrap();
        assert!(books.len() >= 3);
        let slugs: Vec<&str> = books.iter().map(|b| b.slug.as_str()).collect();
        let mut sorted = slugs.clone();
        sorted.sort();
        assert_eq!(slugs, sorted);
    }
}
