//! Built-in Stride schema migrations.
//!
//! These create the checkpoint and delayed job tables used by the PostgreSQL
//! store. They are versioned and applied once (tracked in stride_migrations).

use super::runner::Migration;

const STRIDE_INTERNAL_SQL: &str = include_str!("../../migrations/0000_stride_internal.sql");

/// Get all built-in migrations, in application order.
pub fn get_builtin_migrations() -> Vec<Migration> {
    vec![Migration::new("0000_stride_internal", STRIDE_INTERNAL_SQL)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_builtin_migrations() {
        let migrations = get_builtin_migrations();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].name, "0000_stride_internal");
        assert!(!migrations[0].sql.is_empty());
    }

    #[test]
    fn test_migration_sql_contains_tables() {
        let sql = &get_builtin_migrations()[0].sql;

        assert!(sql.contains("CREATE TABLE IF NOT EXISTS stride_checkpoints"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS stride_jobs"));
    }
}
