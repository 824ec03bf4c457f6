use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS profiles (
            id              TEXT PRIMARY KEY,
            full_name       TEXT,
            phone_number    TEXT,
            paypal_id       TEXT,
            toss_bank_name  TEXT,
            toss_account_no TEXT
        );

        CREATE TABLE IF NOT EXISTS rooms (
            id              TEXT PRIMARY KEY,
            created_at      TEXT NOT NULL,
            start_point     TEXT NOT NULL,
            end_point       TEXT NOT NULL,
            departure_time  TEXT NOT NULL,
            capacity        INTEGER NOT NULL CHECK (capacity > 0),
            status          TEXT NOT NULL DEFAULT 'recruiting',
            host_id         TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_rooms_status
            ON rooms(status, departure_time);

        CREATE TABLE IF NOT EXISTS room_members (
            room_id     TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            joined_at   TEXT NOT NULL,
            PRIMARY KEY (room_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_room_members_user
            ON room_members(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            room_id     TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            content     TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
