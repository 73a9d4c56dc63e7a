//! Collection repository.
//!
//! Named groups of artifacts and/or child collections. Each membership
//! row references exactly one of artifact or child collection; the
//! check constraint in the schema enforces the split.

use rusqlite::{Connection, OptionalExtension, params};

use crate::{
    errors::ProvenanceError,
    store::{
        artifact::ArtifactRepository,
        models::{ArtifactDetail, Collection, CollectionMember},
    },
    utils::unix_now,
};

/// Members of a collection, split by kind.
#[derive(Debug, Default)]
pub struct CollectionMembers {
    pub artifacts: Vec<ArtifactDetail>,
    pub children: Vec<Collection>,
}

/// Repository over `collections` and `collection_members`.
pub struct CollectionRepository<'c> {
    conn: &'c Connection,
}

impl<'c> CollectionRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Create a collection, returning its id.
    pub fn create(
        &self,
        name: &str,
        collection_type: Option<&str>,
        source_type: Option<&str>,
        source_url: Option<&str>,
        metadata: Option<&str>,
    ) -> Result<i64, ProvenanceError> {
        self.conn.execute(
            "INSERT INTO collections
                 (name, collection_type, source_type, source_url, created_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                name,
                collection_type,
                source_type,
                source_url,
                unix_now(),
                metadata
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Add an artifact member; re-adding the same artifact is a no-op.
    pub fn add_artifact(
        &self,
        collection_id: i64,
        artifact_id: &str,
        path_in_collection: Option<&str>,
    ) -> Result<(), ProvenanceError> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM collection_members
                 WHERE collection_id = ?1 AND artifact_id = ?2",
                params![collection_id, artifact_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(());
        }
        self.conn.execute(
            "INSERT INTO collection_members (collection_id, artifact_id, path_in_collection)
             VALUES (?1, ?2, ?3)",
            params![collection_id, artifact_id, path_in_collection],
        )?;
        Ok(())
    }

    /// Add a child collection member; re-adding the same child is a
    /// no-op.
    pub fn add_child(
        &self,
        parent_id: i64,
        child_id: i64,
        path_in_collection: Option<&str>,
    ) -> Result<(), ProvenanceError> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM collection_members
                 WHERE collection_id = ?1 AND child_collection_id = ?2",
                params![parent_id, child_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(());
        }
        self.conn.execute(
            "INSERT INTO collection_members (collection_id, child_collection_id, path_in_collection)
             VALUES (?1, ?2, ?3)",
            params![parent_id, child_id, path_in_collection],
        )?;
        Ok(())
    }

    /// Collection by id.
    pub fn get(&self, collection_id: i64) -> Result<Option<Collection>, ProvenanceError> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM collections WHERE id = ?1",
                params![collection_id],
                Collection::from_row,
            )
            .optional()?)
    }

    /// Most recently created collection with the given name.
    pub fn get_by_name(&self, name: &str) -> Result<Option<Collection>, ProvenanceError> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM collections WHERE name = ?1
                 ORDER BY created_at DESC LIMIT 1",
                params![name],
                Collection::from_row,
            )
            .optional()?)
    }

    /// Most recently created collection with the given source URL.
    pub fn get_by_source(&self, source_url: &str) -> Result<Option<Collection>, ProvenanceError> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM collections WHERE source_url = ?1
                 ORDER BY created_at DESC LIMIT 1",
                params![source_url],
                Collection::from_row,
            )
            .optional()?)
    }

    /// Record an upload destination in the collection's JSON list,
    /// deduplicated.
    pub fn update_upload(
        &self,
        collection_id: i64,
        uploaded_to: &str,
    ) -> Result<(), ProvenanceError> {
        let current: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT uploaded_to FROM collections WHERE id = ?1",
                params![collection_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(());
        };

        let mut destinations: Vec<String> = match current.as_deref() {
            Some(json) => serde_json::from_str(json)?,
            None => Vec::new(),
        };
        if destinations.iter().any(|d| d == uploaded_to) {
            return Ok(());
        }
        destinations.push(uploaded_to.to_string());
        self.conn.execute(
            "UPDATE collections SET uploaded_to = ?1 WHERE id = ?2",
            params![serde_json::to_string(&destinations)?, collection_id],
        )?;
        Ok(())
    }

    /// Direct members of a collection, split into artifacts and child
    /// collections.
    pub fn get_members(
        &self,
        collection_id: i64,
    ) -> Result<CollectionMembers, ProvenanceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM collection_members WHERE collection_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![collection_id], CollectionMember::from_row)?;

        let artifacts_repo = ArtifactRepository::new(self.conn);
        let mut members = CollectionMembers::default();
        for row in rows {
            let member = row?;
            if let Some(artifact_id) = &member.artifact_id {
                if let Some(detail) = artifacts_repo.get(artifact_id)? {
                    members.artifacts.push(detail);
                }
            } else if let Some(child_id) = member.child_collection_id {
                if let Some(child) = self.get(child_id)? {
                    members.children.push(child);
                }
            }
        }
        Ok(members)
    }

    /// Every artifact reachable from a collection, recursing through
    /// child collections. A visited set guards against membership
    /// cycles.
    pub fn get_all_artifacts(
        &self,
        collection_id: i64,
    ) -> Result<Vec<ArtifactDetail>, ProvenanceError> {
        let mut visited = std::collections::HashSet::new();
        let mut artifacts = Vec::new();
        self.collect_artifacts(collection_id, &mut visited, &mut artifacts)?;
        Ok(artifacts)
    }

    fn collect_artifacts(
        &self,
        collection_id: i64,
        visited: &mut std::collections::HashSet<i64>,
        artifacts: &mut Vec<ArtifactDetail>,
    ) -> Result<(), ProvenanceError> {
        if !visited.insert(collection_id) {
            return Ok(());
        }
        let members = self.get_members(collection_id)?;
        artifacts.extend(members.artifacts);
        for child in members.children {
            self.collect_artifacts(child.id, visited, artifacts)?;
        }
        Ok(())
    }
}
