use crate::access::{authorize_governed, AccessContext, AccessMode, OPPORTUNITIES_TABLE, TAXONOMY_NODES_TABLE};
use crate::db::{format_time, load_active_opportunity, load_node, now, query_nodes, Database};
use crate::errors::{classify_store_error, AppError, AppResult};
use crate::migrations;
use crate::models::{CreateNodePayload, NodeOverview, TaxonomyNode};
use rusqlite::{params, TransactionBehavior};
use std::sync::Arc;
use uuid::Uuid;

/// Hierarchical node registry, checked against the caller's role once the
/// opportunity schema has installed access policies.
#[derive(Debug, Clone)]
pub struct TaxonomyStore {
    db: Arc<Database>,
    ctx: AccessContext,
}

impl TaxonomyStore {
    pub fn new(db: Arc<Database>, ctx: AccessContext) -> Self {
        Self { db, ctx }
    }

    pub fn create_node(&self, payload: CreateNodePayload) -> AppResult<TaxonomyNode> {
        let name = payload.name.trim();
        let slug = payload.slug.trim();
        if name.is_empty() || slug.is_empty() {
            return Err(AppError::InvalidInput("node name and slug are required".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let node = {
            let mut conn = self.db.writer()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            authorize_governed(&tx, &self.ctx, TAXONOMY_NODES_TABLE, AccessMode::Write)?;
            tx.execute(
                "INSERT INTO taxonomy_nodes (id, parent_id, name, slug, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, payload.parent_id, name, slug, format_time(now())],
            )
            .map_err(|err| classify_store_error(err, "create taxonomy node"))?;
            let node = load_node(&tx, &id)?
                .ok_or_else(|| AppError::Internal(format!("taxonomy node {id} vanished after insert")))?;
            tx.commit()?;
            node
        };

        tracing::info!(
            node_id = %node.id,
            slug,
            parent_id = ?node.parent_id,
            principal = %self.ctx.principal,
            "taxonomy node created"
        );
        Ok(node)
    }

    pub fn get_node(&self, node_id: &str) -> AppResult<Option<TaxonomyNode>> {
        let conn = self.db.reader()?;
        authorize_governed(&conn, &self.ctx, TAXONOMY_NODES_TABLE, AccessMode::Read)?;
        load_node(&conn, node_id)
    }

    pub fn list_nodes(&self) -> AppResult<Vec<TaxonomyNode>> {
        let conn = self.db.reader()?;
        authorize_governed(&conn, &self.ctx, TAXONOMY_NODES_TABLE, AccessMode::Read)?;
        query_nodes(&conn, "1 = 1", [])
    }

    pub fn list_children(&self, parent_id: &str) -> AppResult<Vec<TaxonomyNode>> {
        let conn = self.db.reader()?;
        let tx = conn.unchecked_transaction()?;
        authorize_governed(&tx, &self.ctx, TAXONOMY_NODES_TABLE, AccessMode::Read)?;
        if load_node(&tx, parent_id)?.is_none() {
            return Err(AppError::NotFound(format!("taxonomy node {parent_id}")));
        }
        let children = query_nodes(&tx, "parent_id = ?1", [parent_id])?;
        tx.finish()?;
        Ok(children)
    }

    /// Removes the node together with its subtree, metrics and opportunities.
    pub fn delete_node(&self, node_id: &str) -> AppResult<bool> {
        let mut conn = self.db.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        authorize_governed(&tx, &self.ctx, TAXONOMY_NODES_TABLE, AccessMode::Write)?;
        let changed = tx
            .execute("DELETE FROM taxonomy_nodes WHERE id = ?1", [node_id])
            .map_err(|err| classify_store_error(err, "delete taxonomy node"))?;
        tx.commit()?;
        if changed > 0 {
            tracing::info!(node_id, principal = %self.ctx.principal, "taxonomy node deleted");
        }
        Ok(changed > 0)
    }

    /// The node and its active opportunity, read from one snapshot.
    pub fn node_overview(&self, node_id: &str) -> AppResult<NodeOverview> {
        let conn = self.db.reader()?;
        let tx = conn.unchecked_transaction()?;
        authorize_governed(&tx, &self.ctx, TAXONOMY_NODES_TABLE, AccessMode::Read)?;
        let node = load_node(&tx, node_id)?.ok_or_else(|| AppError::NotFound(format!("taxonomy node {node_id}")))?;
        let opportunity = if migrations::opportunity_schema_applied(&tx)? {
            authorize_governed(&tx, &self.ctx, OPPORTUNITIES_TABLE, AccessMode::Read)?;
            load_active_opportunity(&tx, node_id)?
        } else {
            None
        };
        tx.finish()?;
        Ok(NodeOverview { node, opportunity })
    }
}
