//! Header propagation: discover the column headers once, reuse them everywhere.
//!
//! Page 0 runs two calls: Phase A asks for the column headers only, then an
//! ordinary item call reads the page's rows. Every later page is prompted
//! with the canonical header list as fixed context (Phase B) and never
//! re-derives it.
//!
//! [`CanonicalHeaders`] is built from page 0's outcome and never mutated
//! afterwards. Clones share one allocation, so handing it to every page task
//! needs no lock.

use crate::prompts;
use std::fmt;
use std::sync::Arc;

/// The run's column headers, fixed after page 0.
#[derive(Clone, PartialEq, Eq)]
pub struct CanonicalHeaders(Arc<[String]>);

impl CanonicalHeaders {
    /// Headers from a successful Phase A.
    pub fn discovered(headers: Vec<String>) -> Self {
        Self(headers.into())
    }

    /// The degraded path when Phase A failed or found nothing.
    pub fn empty() -> Self {
        Self(Arc::from(Vec::<String>::new()))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.to_vec()
    }

    /// Item prompt for `page_index`.
    ///
    /// Page 0 reads its own columns; every other page gets the canonical list,
    /// or the same self-inference wording when the list is empty.
    pub fn item_prompt(&self, page_index: usize, invoice_kind: Option<&str>) -> String {
        if page_index == 0 {
            prompts::first_page_prompt(invoice_kind)
        } else {
            prompts::subsequent_page_prompt(page_index, &self.0, invoice_kind)
        }
    }
}

impl fmt::Debug for CanonicalHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl Default for CanonicalHeaders {
    fn default() -> Self {
        Self::empty()
    }
}
