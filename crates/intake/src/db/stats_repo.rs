//! Aggregate job counts.

use super::{Database, DatabaseError};

/// Number of jobs per stored status. Statuses without jobs are absent.
pub fn count_by_status(db: &Database) -> Result<Vec<(String, u64)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status")?;
        let rows = stmt
            .query_map([], |row| {
                let count: i64 = row.get(1)?;
                Ok((row.get::<_, String>(0)?, count.max(0) as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
