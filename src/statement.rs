//! Prepared statements and the per-connection statement pool.
//!
//! Statements are keyed by the md5 of their SQL text and named after it, so
//! identical SQL is parsed by the server once per connection. The pool is an
//! O(1) LRU; a statement pushed out of it is deallocated on the server right
//! away.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::{debug, warn};

use crate::driver::{Driver, RawResult, WireParam};
use crate::error::{ContractViolation, Result};
use crate::pg::types::Oid;

/// Marker rewritten into `$1`, `$2`, ... before preparing.
pub const PLACEHOLDER: &str = "$*";

/// Server-side prefix of every statement name.
const NAME_PREFIX: &str = "pgb_";

// ============================================================================
// Prepared Statement
// ============================================================================

/// A statement parsed by the server under [`PreparedStatement::name`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    name: String,
    signature: String,
    /// SQL text as sent to the server, placeholders rewritten.
    sql: String,
    param_count: usize,
    /// Type hints the statement was prepared with.
    param_types: Vec<Oid>,
}

impl PreparedStatement {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub fn param_types(&self) -> &[Oid] {
        &self.param_types
    }

    /// Bind `params` positionally and execute.
    pub fn execute(&self, driver: &mut dyn Driver, params: &[WireParam]) -> Result<RawResult> {
        check_param_count(self.param_count, params.len())?;
        driver.execute(&self.name, params)
    }
}

fn check_param_count(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(ContractViolation::ParameterCountMismatch { expected, actual }.into());
    }
    Ok(())
}

/// Content hash identifying a statement: md5 of the SQL text, hex encoded.
pub fn signature(sql: &str) -> String {
    format!("{:x}", md5::compute(sql.as_bytes()))
}

// ============================================================================
// Placeholder rewriting
// ============================================================================

/// Rewrite every `$*` marker into the next ordinal placeholder and count the
/// parameters the statement takes.
///
/// Quoted identifiers, string literals (including `E''` and dollar quoted
/// bodies) and comments are copied untouched. Explicit `$n` placeholders are
/// kept and counted.
pub fn rewrite_placeholders(sql: &str) -> (String, usize) {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len() + 8);
    let mut next_ordinal = 0usize;
    let mut max_explicit = 0usize;
    let mut copied = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                let escapes = i > 0
                    && matches!(bytes[i - 1], b'E' | b'e')
                    && (i < 2 || !is_ident_byte(bytes[i - 2]));
                i = skip_quoted(bytes, i, b'\'', escapes);
            }
            b'"' => i = skip_quoted(bytes, i, b'"', false),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(bytes.len(), |p| i + p + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = find(bytes, i + 2, b"*/").map_or(bytes.len(), |p| p + 2);
            }
            b'$' => match bytes.get(i + 1) {
                Some(b'*') => {
                    next_ordinal += 1;
                    out.push_str(&sql[copied..i]);
                    out.push('$');
                    out.push_str(&next_ordinal.to_string());
                    i += 2;
                    copied = i;
                }
                Some(b) if b.is_ascii_digit() => {
                    let start = i + 1;
                    let end = bytes[start..]
                        .iter()
                        .position(|b| !b.is_ascii_digit())
                        .map_or(bytes.len(), |p| start + p);
                    if let Ok(n) = sql[start..end].parse::<usize>() {
                        max_explicit = max_explicit.max(n);
                    }
                    i = end;
                }
                _ => i = skip_dollar_quoted(bytes, i),
            },
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);

    (out, next_ordinal.max(max_explicit))
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Index just past the literal opened at `start`. A doubled quote stays
/// inside the literal.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if backslash_escapes => i += 2,
            b if b == quote => {
                if bytes.get(i + 1) == Some(&quote) {
                    i += 2;
                } else {
                    return i + 1;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// `$tag$ ... $tag$`. A `$` that does not open a tag is skipped alone.
fn skip_dollar_quoted(bytes: &[u8], start: usize) -> usize {
    let tag_end = bytes[start + 1..]
        .iter()
        .position(|&b| !is_ident_byte(b))
        .map(|p| start + 1 + p);
    match tag_end {
        Some(end)
            if bytes[end] == b'$'
                && bytes.get(start + 1).map_or(true, |b| !b.is_ascii_digit()) =>
        {
            let tag = &bytes[start..=end];
            find(bytes, end + 1, tag).map_or(bytes.len(), |p| p + tag.len())
        }
        _ => start + 1,
    }
}

fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

// ============================================================================
// Statement Pool (O(1) LRU)
// ============================================================================

/// Prepared statements of one connection, keyed by [`signature`].
pub struct StatementPool {
    cache: LruCache<String, Arc<PreparedStatement>>,
}

impl StatementPool {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Return the statement for `sql`, preparing it on a miss.
    ///
    /// `params` are the values of the first execution; their type hints are
    /// used when preparing.
    pub fn get_or_prepare(
        &mut self,
        driver: &mut dyn Driver,
        sql: &str,
        params: &[WireParam],
    ) -> Result<Arc<PreparedStatement>> {
        let signature = signature(sql);
        if let Some(statement) = self.cache.get(&signature) {
            return Ok(Arc::clone(statement));
        }

        let (rewritten, param_count) = rewrite_placeholders(sql);
        check_param_count(param_count, params.len())?;

        let name = format!("{}{}", NAME_PREFIX, signature);
        let param_types: Vec<Oid> = params.iter().map(|p| p.type_hint).collect();
        driver.prepare(&name, &rewritten, &param_types)?;
        debug!(statement = %name, sql = %rewritten, params = param_count, "prepared statement");

        let statement = Arc::new(PreparedStatement {
            name,
            signature: signature.clone(),
            sql: rewritten,
            param_count,
            param_types,
        });

        if let Some((_, evicted)) = self.cache.push(signature, Arc::clone(&statement)) {
            deallocate_quietly(driver, &evicted.name);
        }
        Ok(statement)
    }

    /// Cached statement for `sql` without touching LRU order.
    pub fn get(&self, sql: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.peek(&signature(sql)).map(Arc::clone)
    }

    #[inline]
    pub fn contains(&self, sql: &str) -> bool {
        self.cache.contains(&signature(sql))
    }

    /// Drop the statement for `sql` and deallocate it on the server.
    pub fn remove(&mut self, driver: &mut dyn Driver, sql: &str) -> Result<bool> {
        match self.cache.pop(&signature(sql)) {
            Some(statement) => {
                driver.deallocate(&statement.name)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Deallocate every statement. Failures are logged and skipped so this
    /// can run during teardown.
    pub fn clear(&mut self, driver: &mut dyn Driver) {
        while let Some((_, statement)) = self.cache.pop_lru() {
            deallocate_quietly(driver, &statement.name);
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    /// Server-side names of the cached statements, most recently used first.
    pub fn statement_names(&self) -> Vec<String> {
        self.cache.iter().map(|(_, s)| s.name.clone()).collect()
    }
}

impl Default for StatementPool {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_STATEMENT_CACHE_CAPACITY)
    }
}

fn deallocate_quietly(driver: &mut dyn Driver, name: &str) {
    match driver.deallocate(name) {
        Ok(()) => debug!(statement = %name, "deallocated statement"),
        Err(e) => warn!(statement = %name, error = %e, "failed to deallocate statement"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::driver::Connector;
    use crate::testing::MockConnector;
    use crate::Error;

    fn driver(connector: &MockConnector) -> Box<dyn Driver> {
        connector
            .connect(&DatabaseConfig::new("pgsql", "test", "test"))
            .unwrap()
    }

    fn int(v: i64) -> WireParam {
        WireParam::new(Some(v.to_string()), Oid::INT8)
    }

    #[test]
    fn test_rewrite_positional_markers() {
        let (sql, count) = rewrite_placeholders("SELECT * FROM book WHERE id = $* AND title = $*::text");
        assert_eq!(sql, "SELECT * FROM book WHERE id = $1 AND title = $2::text");
        assert_eq!(count, 2);
    }

    #[test]
    fn test_rewrite_skips_literals_and_comments() {
        let input = "SELECT '$*', \"$*\", E'it\\'s $*', $$ $* $$, $body$ $* $body$ -- $*\n, $* /* $* */";
        let (sql, count) = rewrite_placeholders(input);
        assert_eq!(count, 1);
        assert!(sql.ends_with(", $1 /* $* */"));
        assert!(sql.starts_with("SELECT '$*', \"$*\", E'it\\'s $*'"));
    }

    #[test]
    fn test_explicit_ordinals_are_counted() {
        let (sql, count) = rewrite_placeholders("SELECT $1, $2, $1");
        assert_eq!(sql, "SELECT $1, $2, $1");
        assert_eq!(count, 2);
    }

    #[test]
    fn test_signature_is_stable() {
        assert_eq!(signature("SELECT 1"), signature("SELECT 1"));
        assert_ne!(signature("SELECT 1"), signature("SELECT 2"));
        assert_eq!(signature("").len(), 32);
    }

    #[test]
    fn test_same_sql_prepared_once() {
        let connector = MockConnector::new();
        let mut driver = driver(&connector);
        let mut pool = StatementPool::new(10);

        let sql = "SELECT * FROM book WHERE id = $*";
        let first = pool.get_or_prepare(driver.as_mut(), sql, &[int(1)]).unwrap();
        first.execute(driver.as_mut(), &[int(1)]).unwrap();
        let second = pool.get_or_prepare(driver.as_mut(), sql, &[int(2)]).unwrap();
        second.execute(driver.as_mut(), &[int(2)]).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.prepares(), 1);
        assert_eq!(connector.executes(), 2);
        assert_eq!(first.name(), format!("pgb_{}", signature(sql)));
        assert_eq!(first.sql(), "SELECT * FROM book WHERE id = $1");
        assert_eq!(first.param_types(), &[Oid::INT8]);
    }

    #[test]
    fn test_eviction_deallocates() {
        let connector = MockConnector::new();
        let mut driver = driver(&connector);
        let mut pool = StatementPool::new(2);

        let a = pool.get_or_prepare(driver.as_mut(), "SELECT 1", &[]).unwrap();
        pool.get_or_prepare(driver.as_mut(), "SELECT 2", &[]).unwrap();
        // Touch "SELECT 1" so "SELECT 2" is the least recently used.
        pool.get_or_prepare(driver.as_mut(), "SELECT 1", &[]).unwrap();
        let c = pool.get_or_prepare(driver.as_mut(), "SELECT 3", &[]).unwrap();

        assert_eq!(pool.len(), 2);
        assert!(pool.contains("SELECT 1"));
        assert!(!pool.contains("SELECT 2"));
        assert_eq!(connector.deallocated(), vec![format!("pgb_{}", signature("SELECT 2"))]);
        assert_eq!(pool.statement_names(), vec![c.name().to_string(), a.name().to_string()]);
    }

    #[test]
    fn test_clear_deallocates_everything() {
        let connector = MockConnector::new();
        let mut driver = driver(&connector);
        let mut pool = StatementPool::default();

        pool.get_or_prepare(driver.as_mut(), "SELECT 1", &[]).unwrap();
        pool.get_or_prepare(driver.as_mut(), "SELECT 2", &[]).unwrap();
        pool.clear(driver.as_mut());

        assert!(pool.is_empty());
        assert_eq!(connector.deallocated().len(), 2);
        assert_eq!(pool.capacity(), 100);
    }

    #[test]
    fn test_parameter_count_checked_before_prepare() {
        let connector = MockConnector::new();
        let mut driver = driver(&connector);
        let mut pool = StatementPool::new(4);

        let err = pool
            .get_or_prepare(driver.as_mut(), "SELECT $*, $*", &[int(1)])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Contract(ContractViolation::ParameterCountMismatch {
                expected: 2,
                actual: 1
            })
        ));
        assert_eq!(connector.prepares(), 0);
    }

    #[test]
    fn test_remove_deallocates() {
        let connector = MockConnector::new();
        let mut driver = driver(&connector);
        let mut pool = StatementPool::new(4);

        pool.get_or_prepare(driver.as_mut(), "SELECT 1", &[]).unwrap();
        assert!(pool.remove(driver.as_mut(), "SELECT 1").unwrap());
        assert!(!pool.remove(driver.as_mut(), "SELECT 1").unwrap());
        assert_eq!(connector.deallocated().len(), 1);
    }
}
