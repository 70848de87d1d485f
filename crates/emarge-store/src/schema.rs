pub const SCHEMA: &str = r#"
-- Attendance register: one row per user per calendar day.
-- Uniqueness is enforced here, not in application code: concurrent or
-- repeated clock-in attempts for the same (identity, day) must collapse
-- into a single row.
CREATE TABLE IF NOT EXISTS attendance (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity INTEGER NOT NULL,         -- external user directory id
    day TEXT NOT NULL,                 -- ISO date, e.g. 2026-08-07
    start_time TEXT,                   -- HH:MM:SS, set on clock-in
    end_time TEXT,                     -- HH:MM:SS, set on clock-out
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,

    UNIQUE (identity, day)
);

CREATE INDEX IF NOT EXISTS idx_attendance_identity ON attendance(identity);
CREATE INDEX IF NOT EXISTS idx_attendance_day ON attendance(day);
"#;
