use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::Result;

#[derive(Debug, Clone)]
pub struct UserKey {
    pub wallet: String,
    /// RSA public key in JWK form.
    pub key: String,
    /// Outstanding login challenge; empty means none.
    pub chal: String,
    /// Free-form display settings, JSON.
    pub settings: String,
}

pub fn get(conn: &Connection, wallet: &str) -> Result<Option<UserKey>> {
    conn.query_row(
        "SELECT wallet, key, chal, settings FROM keys WHERE wallet = ?1",
        params![wallet],
        |row| {
            Ok(UserKey {
                wallet: row.get(0)?,
                key: row.get(1)?,
                chal: row.get(2)?,
                settings: row.get(3)?,
            })
        },
    )
    .optional()
}

/// Registers a wallet with its public key and an initial challenge.
pub fn insert(conn: &Connection, wallet: &str, key: &str, chal: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO keys (wallet, key, chal) VALUES (?1, ?2, ?3)",
        params![wallet, key, chal],
    )?;

    Ok(())
}

/// Stores a key learned through group resolution. Keeps any outstanding
/// challenge if the wallet is somehow already present.
pub fn store_resolved_key(conn: &Connection, wallet: &str, key: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO keys (wallet, key) VALUES (?1, ?2) \
         ON CONFLICT(wallet) DO UPDATE SET key = excluded.key",
        params![wallet, key],
    )?;

    Ok(())
}

/// Overwrites the wallet's outstanding challenge.
pub fn set_challenge(conn: &Connection, wallet: &str, chal: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE keys SET chal = ?1 WHERE wallet = ?2",
        params![chal, wallet],
    )?;

    Ok(rows == 1)
}

/// Clears the challenge iff `candidate` matches the stored, non-empty value.
/// The compare-and-clear is a single statement, so a challenge can be
/// consumed at most once.
pub fn consume_challenge(conn: &Connection, wallet: &str, candidate: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE keys SET chal = '' WHERE wallet = ?1 AND chal = ?2 AND chal != ''",
        params![wallet, candidate],
    )?;

    Ok(rows == 1)
}
