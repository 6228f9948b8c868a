//! Mock library matcher for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::item::{CandidateAttributes, Item};
use crate::library::{LibraryAssignment, LibraryError, LibraryMatcher};

/// Mock implementation of the LibraryMatcher trait.
///
/// Assigns every item the configured library (main only by default).
#[derive(Debug, Default)]
pub struct MockLibraryMatcher {
    assignment: Arc<RwLock<LibraryAssignment>>,
    next_error: Arc<RwLock<Option<LibraryError>>>,
    call_count: Arc<RwLock<usize>>,
}

impl MockLibraryMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_assignment(&self, assignment: LibraryAssignment) {
        *self.assignment.write().await = assignment;
    }

    pub async fn set_next_error(&self, error: LibraryError) {
        *self.next_error.write().await = Some(error);
    }

    pub async fn call_count(&self) -> usize {
        *self.call_count.read().await
    }
}

#[async_trait]
impl LibraryMatcher for MockLibraryMatcher {
    fn name(&self) -> &str {
        "mock"
    }

    async fn assign(
        &self,
        _item: &Item,
        _hints: Option<&CandidateAttributes>,
    ) -> Result<LibraryAssignment, LibraryError> {
        *self.call_count.write().await += 1;
        if let Some(error) = self.next_error.write().await.take() {
            return Err(error);
        }
        Ok(self.assignment.read().await.clone())
    }
}
