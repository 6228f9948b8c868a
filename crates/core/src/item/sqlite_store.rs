//! SQLite-backed item store implementation.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};

use super::store::{ItemFilter, ItemStore, StoreError, UpsertOutcome};
use super::types::{
    Candidate, CandidateAttributes, CandidateStatus, Claim, Episode, ExternalIds, Item,
    ItemMetadata, ItemStage, MetadataUpdate, NewItem, NewSeason, PipelineStage, Season,
    SeasonWithEpisodes, SelectionRecord, StageUpdate, SubjectRef,
};

const ITEM_COLUMNS: &str = "id, title, year, media_kind, category, imdb_id, tmdb_id, tvdb_id, \
     current_stage, retry_count, retry_after, requested_at, release_date, assigned_library, \
     duplicate_in_main_library, metadata, created_at, updated_at";

const CANDIDATE_COLUMNS: &str = "id, item_id, subject_key, source_identifier, raw_title, \
     attributes, score, rank, status, local_path, download_started_at, created_at, updated_at";

/// SQLite-backed item store.
pub struct SqliteItemStore {
    conn: Mutex<Connection>,
}

impl SqliteItemStore {
    /// Open (or create) the database file and its tables.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                year INTEGER,
                media_kind TEXT NOT NULL,
                category TEXT,
                imdb_id TEXT,
                tmdb_id INTEGER,
                tvdb_id INTEGER,
                current_stage TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_after TEXT,
                requested_at TEXT NOT NULL,
                release_date TEXT,
                assigned_library TEXT,
                duplicate_in_main_library INTEGER NOT NULL DEFAULT 0,
                metadata TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_items_stage ON items(current_stage);
            CREATE INDEX IF NOT EXISTS idx_items_imdb ON items(imdb_id);
            CREATE INDEX IF NOT EXISTS idx_items_tmdb ON items(tmdb_id);
            CREATE INDEX IF NOT EXISTS idx_items_title_year ON items(title COLLATE NOCASE, year);

            CREATE TABLE IF NOT EXISTS seasons (
                id TEXT PRIMARY KEY,
                item_id TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                season_number INTEGER NOT NULL,
                air_date TEXT,
                expected_episode_count INTEGER NOT NULL DEFAULT 0,
                UNIQUE(item_id, season_number)
            );

            CREATE TABLE IF NOT EXISTS episodes (
                id TEXT PRIMARY KEY,
                season_id TEXT NOT NULL REFERENCES seasons(id) ON DELETE CASCADE,
                item_id TEXT NOT NULL,
                season_number INTEGER NOT NULL,
                episode_number INTEGER NOT NULL,
                title TEXT,
                air_date TEXT,
                scraped INTEGER NOT NULL DEFAULT 0,
                chosen_candidate_id TEXT,
                UNIQUE(season_id, episode_number)
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_item ON episodes(item_id);

            CREATE TABLE IF NOT EXISTS candidates (
                id TEXT PRIMARY KEY,
                item_id TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                subject_key TEXT NOT NULL,
                source_identifier TEXT NOT NULL,
                raw_title TEXT NOT NULL,
                attributes TEXT NOT NULL,
                score INTEGER NOT NULL,
                rank INTEGER NOT NULL,
                status TEXT NOT NULL,
                local_path TEXT,
                download_started_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(item_id, subject_key, source_identifier)
            );

            CREATE INDEX IF NOT EXISTS idx_candidates_item_status ON candidates(item_id, status);

            CREATE TABLE IF NOT EXISTS blacklist (
                item_id TEXT NOT NULL,
                source_identifier TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY(item_id, source_identifier)
            );

            CREATE TABLE IF NOT EXISTS claims (
                item_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                claim_id TEXT NOT NULL,
                claimed_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                PRIMARY KEY(item_id, stage)
            );
            "#,
        )?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection mutex poisoned".to_string()))
    }

    fn build_where_clause(filter: &ItemFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !filter.stages.is_empty() {
            let placeholders = vec!["?"; filter.stages.len()].join(", ");
            conditions.push(format!("current_stage IN ({})", placeholders));
            for stage in &filter.stages {
                params.push(Box::new(stage.as_str()));
            }
        }

        if let Some(kind) = filter.media_kind {
            conditions.push("media_kind = ?".to_string());
            params.push(Box::new(kind.as_str()));
        }

        if let Some(now) = filter.ready_at {
            conditions.push("(retry_after IS NULL OR retry_after <= ?)".to_string());
            params.push(Box::new(fmt_ts(now)));
        }

        if let Some(now) = filter.unclaimed_at {
            conditions.push(
                "NOT EXISTS (SELECT 1 FROM claims c WHERE c.item_id = items.id \
                 AND c.expires_at > ?)"
                    .to_string(),
            );
            params.push(Box::new(fmt_ts(now)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<Item> {
        let metadata_json: Option<String> = row.get(15)?;
        Ok(Item {
            id: row.get(0)?,
            title: row.get(1)?,
            year: row.get(2)?,
            media_kind: parse_col(row, 3)?,
            category: row.get(4)?,
            external_ids: ExternalIds {
                imdb: row.get(5)?,
                tmdb: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
                tvdb: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
            },
            current_stage: parse_col(row, 8)?,
            retry_count: row.get(9)?,
            retry_after: opt_ts(row, 10)?,
            requested_at: ts(row, 11)?,
            release_date: opt_date(row, 12)?,
            assigned_library: row.get(13)?,
            duplicate_in_main_library: row.get(14)?,
            metadata: metadata_json.and_then(|json| serde_json::from_str::<ItemMetadata>(&json).ok()),
            created_at: ts(row, 16)?,
            updated_at: ts(row, 17)?,
        })
    }

    fn row_to_candidate(row: &rusqlite::Row) -> rusqlite::Result<Candidate> {
        let subject_key: String = row.get(2)?;
        let subject = SubjectRef::parse_key(&subject_key).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("bad subject key: {}", subject_key).into(),
            )
        })?;
        let attributes_json: String = row.get(5)?;
        let attributes: CandidateAttributes =
            serde_json::from_str(&attributes_json).unwrap_or_default();

        Ok(Candidate {
            id: row.get(0)?,
            item_id: row.get(1)?,
            subject,
            source_identifier: row.get(3)?,
            raw_title: row.get(4)?,
            attributes,
            score: row.get(6)?,
            rank: row.get(7)?,
            status: parse_col(row, 8)?,
            local_path: row.get(9)?,
            download_started_at: opt_ts(row, 10)?,
            created_at: ts(row, 11)?,
            updated_at: ts(row, 12)?,
        })
    }

    fn get_item_tx(conn: &Connection, id: &str) -> Result<Option<Item>, StoreError> {
        let sql = format!("SELECT {} FROM items WHERE id = ?", ITEM_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], Self::row_to_item)
            .optional()?)
    }

    fn get_candidate_tx(conn: &Connection, id: &str) -> Result<Option<Candidate>, StoreError> {
        let sql = format!("SELECT {} FROM candidates WHERE id = ?", CANDIDATE_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], Self::row_to_candidate)
            .optional()?)
    }

    fn find_existing(conn: &Connection, item: &NewItem) -> Result<Option<Item>, StoreError> {
        let kind = item.media_kind.as_str();

        if let Some(ref imdb) = item.external_ids.imdb {
            let sql = format!(
                "SELECT {} FROM items WHERE imdb_id = ? AND media_kind = ? LIMIT 1",
                ITEM_COLUMNS
            );
            if let Some(found) = conn
                .query_row(&sql, params![imdb, kind], Self::row_to_item)
                .optional()?
            {
                return Ok(Some(found));
            }
        }

        if let Some(tmdb) = item.external_ids.tmdb {
            let sql = format!(
                "SELECT {} FROM items WHERE tmdb_id = ? AND media_kind = ? LIMIT 1",
                ITEM_COLUMNS
            );
            if let Some(found) = conn
                .query_row(&sql, params![tmdb as i64, kind], Self::row_to_item)
                .optional()?
            {
                return Ok(Some(found));
            }
        }

        let sql = format!(
            "SELECT {} FROM items WHERE title = ? COLLATE NOCASE AND year IS ? \
             AND media_kind = ? LIMIT 1",
            ITEM_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![item.title, item.year, kind], Self::row_to_item)
            .optional()?)
    }

    /// Demote whatever is selected for the subject or for the covered episodes.
    fn demote_selected(
        tx: &Transaction,
        item_id: &str,
        subject_key: &str,
        episode_ids: &[String],
        keep_id: Option<&str>,
        now: &str,
    ) -> Result<(), StoreError> {
        tx.execute(
            "UPDATE candidates SET status = 'rejected', updated_at = ?1 \
             WHERE item_id = ?2 AND subject_key = ?3 AND status = 'selected' \
             AND id IS NOT ?4",
            params![now, item_id, subject_key, keep_id],
        )?;

        for episode_id in episode_ids {
            tx.execute(
                "UPDATE candidates SET status = 'rejected', updated_at = ?1 \
                 WHERE status = 'selected' AND id IS NOT ?3 AND id = \
                 (SELECT chosen_candidate_id FROM episodes WHERE id = ?2)",
                params![now, episode_id, keep_id],
            )?;
        }

        Ok(())
    }

    fn point_episodes(
        tx: &Transaction,
        episode_ids: &[String],
        candidate_id: &str,
    ) -> Result<(), StoreError> {
        for episode_id in episode_ids {
            tx.execute(
                "UPDATE episodes SET scraped = 1, chosen_candidate_id = ?1 WHERE id = ?2",
                params![candidate_id, episode_id],
            )?;
        }
        Ok(())
    }
}

impl ItemStore for SqliteItemStore {
    fn upsert_item(&self, item: NewItem) -> Result<UpsertOutcome, StoreError> {
        if item.title.trim().is_empty() {
            return Err(StoreError::Invalid("title must not be empty".to_string()));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if let Some(existing) = Self::find_existing(&tx, &item)? {
            let mut ids = existing.external_ids.clone();
            ids.merge(&item.external_ids);
            if ids != existing.external_ids {
                tx.execute(
                    "UPDATE items SET imdb_id = ?1, tmdb_id = ?2, tvdb_id = ?3, updated_at = ?4 \
                     WHERE id = ?5",
                    params![
                        ids.imdb,
                        ids.tmdb.map(|v| v as i64),
                        ids.tvdb.map(|v| v as i64),
                        fmt_ts(Utc::now()),
                        existing.id
                    ],
                )?;
            }
            let refreshed = Self::get_item_tx(&tx, &existing.id)?
                .ok_or_else(|| StoreError::NotFound(existing.id.clone()))?;
            tx.commit()?;
            return Ok(UpsertOutcome {
                item: refreshed,
                created: false,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let requested_at = item.requested_at.unwrap_or(now);

        tx.execute(
            r#"
            INSERT INTO items (id, title, year, media_kind, category, imdb_id, tmdb_id, tvdb_id,
                current_stage, retry_count, retry_after, requested_at, release_date,
                assigned_library, duplicate_in_main_library, metadata, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, NULL, ?10, ?11, NULL, 0, NULL, ?12, ?12)
            "#,
            params![
                id,
                item.title.trim(),
                item.year,
                item.media_kind.as_str(),
                item.category,
                item.external_ids.imdb,
                item.external_ids.tmdb.map(|v| v as i64),
                item.external_ids.tvdb.map(|v| v as i64),
                ItemStage::New.as_str(),
                fmt_ts(requested_at),
                item.release_date.map(fmt_date),
                fmt_ts(now),
            ],
        )?;

        let created = Self::get_item_tx(&tx, &id)?.ok_or_else(|| StoreError::NotFound(id))?;
        tx.commit()?;

        Ok(UpsertOutcome {
            item: created,
            created: true,
        })
    }

    fn get_item(&self, id: &str) -> Result<Option<Item>, StoreError> {
        let conn = self.conn()?;
        Self::get_item_tx(&conn, id)
    }

    fn list_items(&self, filter: &ItemFilter) -> Result<Vec<Item>, StoreError> {
        let conn = self.conn()?;
        let (where_clause, mut params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT {} FROM items {} ORDER BY requested_at ASC, id ASC LIMIT ? OFFSET ?",
            ITEM_COLUMNS, where_clause
        );
        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));

        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params_from_iter(params.iter().map(|p| p.as_ref())), Self::row_to_item)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(items)
    }

    fn count_items(&self, filter: &ItemFilter) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM items {}", where_clause);

        Ok(conn.query_row(
            &sql,
            params_from_iter(params.iter().map(|p| p.as_ref())),
            |row| row.get(0),
        )?)
    }

    fn count_by_stage(&self) -> Result<Vec<(ItemStage, i64)>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT current_stage, COUNT(*) FROM items GROUP BY current_stage ORDER BY current_stage",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((parse_col::<ItemStage>(row, 0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn save_metadata(&self, item_id: &str, update: &MetadataUpdate) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let item = Self::get_item_tx(&tx, item_id)?
            .ok_or_else(|| StoreError::NotFound(item_id.to_string()))?;

        let mut ids = update.external_ids.clone();
        ids.merge(&item.external_ids);

        tx.execute(
            r#"
            UPDATE items SET title = ?1, year = ?2, imdb_id = ?3, tmdb_id = ?4, tvdb_id = ?5,
                release_date = ?6, metadata = ?7, updated_at = ?8
            WHERE id = ?9
            "#,
            params![
                update.title.clone().unwrap_or(item.title),
                update.year.or(item.year),
                ids.imdb,
                ids.tmdb.map(|v| v as i64),
                ids.tvdb.map(|v| v as i64),
                update.release_date.or(item.release_date).map(fmt_date),
                serde_json::to_string(&update.metadata)?,
                fmt_ts(Utc::now()),
                item_id,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn save_library_assignment(
        &self,
        item_id: &str,
        library: Option<&str>,
        duplicate_in_main_library: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE items SET assigned_library = ?1, duplicate_in_main_library = ?2, \
             updated_at = ?3 WHERE id = ?4",
            params![
                library,
                duplicate_in_main_library,
                fmt_ts(Utc::now()),
                item_id
            ],
        )?;

        if changed == 0 {
            return Err(StoreError::NotFound(item_id.to_string()));
        }
        Ok(())
    }

    fn apply_stage_update(
        &self,
        item_id: &str,
        update: &StageUpdate,
    ) -> Result<Item, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let item = Self::get_item_tx(&tx, item_id)?
            .ok_or_else(|| StoreError::NotFound(item_id.to_string()))?;

        if item.current_stage != update.from {
            return Err(StoreError::StageConflict {
                item_id: item_id.to_string(),
                expected: update.from,
                actual: item.current_stage,
            });
        }

        if !update.from.can_transition_to(update.to) {
            return Err(StoreError::IllegalTransition {
                item_id: item_id.to_string(),
                from: update.from,
                to: update.to,
            });
        }

        tx.execute(
            "UPDATE items SET current_stage = ?1, retry_count = ?2, retry_after = ?3, \
             updated_at = ?4 WHERE id = ?5",
            params![
                update.to.as_str(),
                update.retry_count,
                update.retry_after.map(fmt_ts),
                fmt_ts(Utc::now()),
                item_id
            ],
        )?;

        let updated = Self::get_item_tx(&tx, item_id)?
            .ok_or_else(|| StoreError::NotFound(item_id.to_string()))?;
        tx.commit()?;
        Ok(updated)
    }

    fn upsert_seasons(&self, item_id: &str, seasons: &[NewSeason]) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        for season in seasons {
            let expected = season.episodes.len() as u32;
            tx.execute(
                r#"
                INSERT INTO seasons (id, item_id, season_number, air_date, expected_episode_count)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(item_id, season_number) DO UPDATE SET
                    air_date = excluded.air_date,
                    expected_episode_count = excluded.expected_episode_count
                "#,
                params![
                    uuid::Uuid::new_v4().to_string(),
                    item_id,
                    season.season_number,
                    season.air_date.map(fmt_date),
                    expected,
                ],
            )?;

            let season_id: String = tx.query_row(
                "SELECT id FROM seasons WHERE item_id = ?1 AND season_number = ?2",
                params![item_id, season.season_number],
                |row| row.get(0),
            )?;

            for episode in &season.episodes {
                tx.execute(
                    r#"
                    INSERT INTO episodes (id, season_id, item_id, season_number, episode_number,
                        title, air_date, scraped, chosen_candidate_id)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL)
                    ON CONFLICT(season_id, episode_number) DO UPDATE SET
                        title = excluded.title,
                        air_date = excluded.air_date
                    "#,
                    params![
                        uuid::Uuid::new_v4().to_string(),
                        season_id,
                        item_id,
                        season.season_number,
                        episode.episode_number,
                        episode.title,
                        episode.air_date.map(fmt_date),
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn list_seasons(&self, item_id: &str) -> Result<Vec<SeasonWithEpisodes>, StoreError> {
        let conn = self.conn()?;

        let mut season_stmt = conn.prepare(
            "SELECT id, item_id, season_number, air_date, expected_episode_count \
             FROM seasons WHERE item_id = ? ORDER BY season_number",
        )?;
        let seasons = season_stmt
            .query_map(params![item_id], |row| {
                Ok(Season {
                    id: row.get(0)?,
                    item_id: row.get(1)?,
                    season_number: row.get(2)?,
                    air_date: opt_date(row, 3)?,
                    expected_episode_count: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut episode_stmt = conn.prepare(
            "SELECT id, season_id, season_number, episode_number, title, air_date, scraped, \
             chosen_candidate_id FROM episodes WHERE season_id = ? ORDER BY episode_number",
        )?;

        let mut result = Vec::with_capacity(seasons.len());
        for season in seasons {
            let episodes = episode_stmt
                .query_map(params![season.id], |row| {
                    Ok(Episode {
                        id: row.get(0)?,
                        season_id: row.get(1)?,
                        season_number: row.get(2)?,
                        episode_number: row.get(3)?,
                        title: row.get(4)?,
                        air_date: opt_date(row, 5)?,
                        scraped: row.get(6)?,
                        chosen_candidate_id: row.get(7)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            result.push(SeasonWithEpisodes { season, episodes });
        }

        Ok(result)
    }

    fn record_selection(
        &self,
        item_id: &str,
        selection: &SelectionRecord,
    ) -> Result<Candidate, StoreError> {
        let winner = selection.candidates.get(selection.selected).ok_or_else(|| {
            StoreError::Invalid(format!(
                "selected index {} out of {} candidates",
                selection.selected,
                selection.candidates.len()
            ))
        })?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = fmt_ts(Utc::now());
        let subject_key = selection.subject.key();

        Self::demote_selected(
            &tx,
            item_id,
            &subject_key,
            &selection.episode_ids,
            None,
            &now,
        )?;

        for (rank, candidate) in selection.candidates.iter().enumerate() {
            let status = if rank == selection.selected {
                CandidateStatus::Selected
            } else {
                CandidateStatus::Rejected
            };

            tx.execute(
                r#"
                INSERT INTO candidates (id, item_id, subject_key, source_identifier, raw_title,
                    attributes, score, rank, status, local_path, download_started_at,
                    created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL, ?10, ?10)
                ON CONFLICT(item_id, subject_key, source_identifier) DO UPDATE SET
                    raw_title = excluded.raw_title,
                    attributes = excluded.attributes,
                    score = excluded.score,
                    rank = excluded.rank,
                    status = CASE WHEN candidates.status IN ('selected', 'rejected')
                        THEN excluded.status ELSE candidates.status END,
                    updated_at = excluded.updated_at
                "#,
                params![
                    uuid::Uuid::new_v4().to_string(),
                    item_id,
                    subject_key,
                    candidate.source_identifier,
                    candidate.raw_title,
                    serde_json::to_string(&candidate.attributes)?,
                    candidate.score,
                    rank as u32,
                    status.as_str(),
                    now,
                ],
            )?;
        }

        let winner_id: String = tx.query_row(
            "SELECT id FROM candidates WHERE item_id = ?1 AND subject_key = ?2 \
             AND source_identifier = ?3",
            params![item_id, subject_key, winner.source_identifier],
            |row| row.get(0),
        )?;

        Self::point_episodes(&tx, &selection.episode_ids, &winner_id)?;

        let stored = Self::get_candidate_tx(&tx, &winner_id)?
            .ok_or_else(|| StoreError::CandidateNotFound(winner_id.clone()))?;
        tx.commit()?;
        Ok(stored)
    }

    fn promote_candidate(
        &self,
        candidate_id: &str,
        episode_ids: &[String],
    ) -> Result<Candidate, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = fmt_ts(Utc::now());

        let candidate = Self::get_candidate_tx(&tx, candidate_id)?
            .ok_or_else(|| StoreError::CandidateNotFound(candidate_id.to_string()))?;

        if candidate.status == CandidateStatus::Blacklisted {
            return Err(StoreError::Invalid(format!(
                "candidate {} is blacklisted",
                candidate_id
            )));
        }

        Self::demote_selected(
            &tx,
            &candidate.item_id,
            &candidate.subject.key(),
            episode_ids,
            Some(candidate_id),
            &now,
        )?;

        tx.execute(
            "UPDATE candidates SET status = 'selected', updated_at = ?1 WHERE id = ?2",
            params![now, candidate_id],
        )?;
        Self::point_episodes(&tx, episode_ids, candidate_id)?;

        let stored = Self::get_candidate_tx(&tx, candidate_id)?
            .ok_or_else(|| StoreError::CandidateNotFound(candidate_id.to_string()))?;
        tx.commit()?;
        Ok(stored)
    }

    fn get_candidate(&self, id: &str) -> Result<Option<Candidate>, StoreError> {
        let conn = self.conn()?;
        Self::get_candidate_tx(&conn, id)
    }

    fn list_candidates(
        &self,
        item_id: &str,
        status: Option<CandidateStatus>,
    ) -> Result<Vec<Candidate>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM candidates WHERE item_id = ?1 AND (?2 IS NULL OR status = ?2) \
             ORDER BY subject_key, rank",
            CANDIDATE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let candidates = stmt
            .query_map(
                params![item_id, status.map(|s| s.as_str())],
                Self::row_to_candidate,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(candidates)
    }

    fn update_candidate_status(
        &self,
        candidate_id: &str,
        status: CandidateStatus,
        local_path: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let now = fmt_ts(Utc::now());

        // download_started_at is stamped on the first move into downloading only.
        let changed = conn.execute(
            r#"
            UPDATE candidates SET
                status = ?1,
                local_path = COALESCE(?2, local_path),
                download_started_at = CASE
                    WHEN ?1 = 'downloading' AND download_started_at IS NULL THEN ?3
                    ELSE download_started_at END,
                updated_at = ?3
            WHERE id = ?4
            "#,
            params![status.as_str(), local_path, now, candidate_id],
        )?;

        if changed == 0 {
            return Err(StoreError::CandidateNotFound(candidate_id.to_string()));
        }
        Ok(())
    }

    fn blacklist_candidate(
        &self,
        candidate_id: &str,
        reason: &str,
    ) -> Result<Candidate, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = fmt_ts(Utc::now());

        let candidate = Self::get_candidate_tx(&tx, candidate_id)?
            .ok_or_else(|| StoreError::CandidateNotFound(candidate_id.to_string()))?;

        tx.execute(
            "INSERT OR IGNORE INTO blacklist (item_id, source_identifier, reason, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![candidate.item_id, candidate.source_identifier, reason, now],
        )?;

        // The same release may be pooled under several subjects of the item.
        tx.execute(
            "UPDATE candidates SET status = 'blacklisted', updated_at = ?1 \
             WHERE item_id = ?2 AND source_identifier = ?3 \
             AND status IN ('selected', 'rejected', 'downloading', 'failed')",
            params![now, candidate.item_id, candidate.source_identifier],
        )?;

        let stored = Self::get_candidate_tx(&tx, candidate_id)?
            .ok_or_else(|| StoreError::CandidateNotFound(candidate_id.to_string()))?;
        tx.commit()?;
        Ok(stored)
    }

    fn blacklisted_sources(&self, item_id: &str) -> Result<HashSet<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT source_identifier FROM blacklist WHERE item_id = ?")?;
        let sources = stmt
            .query_map(params![item_id], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(sources)
    }

    fn defer_item(
        &self,
        item_id: &str,
        stage: ItemStage,
        retry_after: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE items SET retry_after = ?1, updated_at = ?2 \
             WHERE id = ?3 AND current_stage = ?4",
            params![
                fmt_ts(retry_after),
                fmt_ts(Utc::now()),
                item_id,
                stage.as_str()
            ],
        )?;
        Ok(changed == 1)
    }

    fn clear_episode_selection(&self, episode_ids: &[String]) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for episode_id in episode_ids {
            tx.execute(
                "UPDATE episodes SET scraped = 0, chosen_candidate_id = NULL WHERE id = ?",
                params![episode_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn try_claim(
        &self,
        item_id: &str,
        stage: PipelineStage,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Claim>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let claim = Claim {
            claim_id: uuid::Uuid::new_v4().to_string(),
            item_id: item_id.to_string(),
            stage,
            claimed_at: now,
            expires_at: now + lease,
        };

        // One live claim per item, whatever the stage.
        let held_elsewhere: bool = tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM claims WHERE item_id = ?1 AND stage != ?2 \
             AND expires_at > ?3)",
            params![claim.item_id, stage.as_str(), fmt_ts(now)],
            |row| row.get(0),
        )?;
        if held_elsewhere {
            return Ok(None);
        }

        // Expired claims are taken over in place.
        let changed = tx.execute(
            r#"
            INSERT INTO claims (item_id, stage, claim_id, claimed_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(item_id, stage) DO UPDATE SET
                claim_id = excluded.claim_id,
                claimed_at = excluded.claimed_at,
                expires_at = excluded.expires_at
            WHERE claims.expires_at <= ?4
            "#,
            params![
                claim.item_id,
                stage.as_str(),
                claim.claim_id,
                fmt_ts(claim.claimed_at),
                fmt_ts(claim.expires_at),
            ],
        )?;
        tx.commit()?;

        Ok((changed == 1).then_some(claim))
    }

    fn release_claim(&self, claim: &Claim) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM claims WHERE item_id = ?1 AND stage = ?2 AND claim_id = ?3",
            params![claim.item_id, claim.stage.as_str(), claim.claim_id],
        )?;
        Ok(())
    }

    fn claimed_items(
        &self,
        stage: PipelineStage,
        now: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT item_id FROM claims WHERE stage = ?1 AND expires_at > ?2")?;
        let ids = stmt
            .query_map(params![stage.as_str(), fmt_ts(now)], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn fmt_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e.to_string()))
}

fn opt_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| conversion_error(idx, e.to_string())),
        None => Ok(None),
    }
}

fn opt_date(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map(Some)
            .map_err(|e| conversion_error(idx, e.to_string())),
        None => Ok(None),
    }
}

fn parse_col<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: T::Err| conversion_error(idx, e.to_string()))
}
