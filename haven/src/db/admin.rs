use rusqlite::params;
use rusqlite::Connection;
use rusqlite::Result;

const ADMIN_ROLE: &str = "admin";

/// Overwrites the administrator's outstanding challenge.
pub fn set_challenge(conn: &Connection, chal: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO admin (role, chal) VALUES (?1, ?2) \
         ON CONFLICT(role) DO UPDATE SET chal = excluded.chal",
        params![ADMIN_ROLE, chal],
    )?;

    Ok(())
}

/// Clears the challenge iff `candidate` matches the stored, non-empty value.
pub fn consume_challenge(conn: &Connection, candidate: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE admin SET chal = '' WHERE role = ?1 AND chal = ?2 AND chal != ''",
        params![ADMIN_ROLE, candidate],
    )?;

    Ok(rows == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;

    #[test]
    fn later_challenge_replaces_the_earlier_one() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        set_challenge(&conn, "111").unwrap();
        set_challenge(&conn, "222").unwrap();

        assert!(!consume_challenge(&conn, "111").unwrap());
        assert!(consume_challenge(&conn, "222").unwrap());
        assert!(!consume_challenge(&conn, "222").unwrap());
    }
}
