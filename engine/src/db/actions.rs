use std::collections::{HashMap, HashSet};

use anyhow::Context;
use deadpool_postgres::Pool;
use drover_common::error::{Error, Result};
use serde_json::Value;
use tokio_postgres::Transaction;
use uuid::Uuid;

use crate::db::truncate_reason;
use crate::models::{
    Action, ActionStatus, ActionVerb, ControlSignal, TargetType, ids_from_jsonb, ids_to_jsonb,
};

const ACTION_COLS: &str = "id, target_id, target_type, verb, inputs, outputs, owner, status, \
     status_reason, control, depends_on, depended_by, created_time, updated_time, finished_time";

pub const REASON_WAITING: &str = "Waiting for depended actions to complete.";
pub const REASON_READY: &str = "All dependencies satisfied.";
pub const REASON_RUNNING: &str = "The action is being processed.";
pub const REASON_STOLEN: &str = "stolen";
pub const REASON_TIMEOUT: &str = "timeout";

/// One side of a dependency declaration: a single action or a list, never
/// both sides as lists.
#[derive(Debug, Clone)]
pub enum DepRef {
    One(Uuid),
    Many(Vec<Uuid>),
}

impl DepRef {
    fn ids(&self) -> Vec<Uuid> {
        match self {
            DepRef::One(id) => vec![*id],
            DepRef::Many(ids) => ids.clone(),
        }
    }

    fn is_many(&self) -> bool {
        matches!(self, DepRef::Many(_))
    }
}

impl From<Uuid> for DepRef {
    fn from(id: Uuid) -> Self {
        DepRef::One(id)
    }
}

impl From<Vec<Uuid>> for DepRef {
    fn from(ids: Vec<Uuid>) -> Self {
        DepRef::Many(ids)
    }
}

pub struct NewAction {
    pub id: Uuid,
    pub target_id: Uuid,
    pub target_type: TargetType,
    pub verb: ActionVerb,
    pub inputs: Value,
    pub depends_on: Vec<Uuid>,
}

/// Create an action record together with its inbound dependency edges and
/// its computed initial state, all in one transaction: READY when nothing is
/// outstanding, WAITING otherwise.
pub async fn action_create(pool: &Pool, values: NewAction) -> Result<Action> {
    let mut client = pool.get().await.context("failed to get db connection")?;
    let tx = client
        .transaction()
        .await
        .context("failed to start transaction")?;

    // Dependencies that already succeeded are satisfied; ones that already
    // failed or were cancelled would cascade the new action straight to a
    // terminal state, which is a submission error.
    let mut outstanding: Vec<Uuid> = Vec::new();
    for dep in &values.depends_on {
        let row = tx
            .query_opt(
                "SELECT status FROM actions WHERE id = $1 FOR UPDATE",
                &[dep],
            )
            .await
            .context("failed to read dependency")?;
        let Some(row) = row else {
            tx.rollback().await.context("failed to rollback")?;
            return Err(Error::not_found("action", *dep));
        };
        let status = ActionStatus::parse(row.get("status"))?;
        match status {
            ActionStatus::Succeeded => {}
            ActionStatus::Failed | ActionStatus::Cancelled => {
                tx.rollback().await.context("failed to rollback")?;
                return Err(Error::Invalid(format!(
                    "dependency {dep} already finished as {}",
                    status.as_str()
                )));
            }
            _ => outstanding.push(*dep),
        }
    }

    let (status, reason) = if outstanding.is_empty() {
        (ActionStatus::Ready, REASON_READY)
    } else {
        (ActionStatus::Waiting, REASON_WAITING)
    };

    let row = tx
        .query_one(
            &format!(
                r#"
                INSERT INTO actions (id, target_id, target_type, verb, inputs, status, status_reason, depends_on)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING {ACTION_COLS}
                "#
            ),
            &[
                &values.id,
                &values.target_id,
                &values.target_type.as_str(),
                &values.verb.as_str(),
                &values.inputs,
                &status.as_str(),
                &reason,
                &ids_to_jsonb(&outstanding),
            ],
        )
        .await
        .context("failed to insert action")?;

    for dep in &outstanding {
        let edges = read_edges(&tx, *dep).await?;
        let mut depended_by = edges.depended_by;
        if !depended_by.contains(&values.id) {
            depended_by.push(values.id);
        }
        tx.execute(
            "UPDATE actions SET depended_by = $2, updated_time = now() WHERE id = $1",
            &[dep, &ids_to_jsonb(&depended_by)],
        )
        .await
        .context("failed to link dependency edge")?;
    }

    tx.commit().await.context("failed to commit transaction")?;
    Action::from_row(&row).map_err(Error::from)
}

pub async fn action_get(pool: &Pool, id: Uuid) -> Result<Action> {
    action_get_opt(pool, id)
        .await?
        .ok_or_else(|| Error::not_found("action", id))
}

pub async fn action_get_opt(pool: &Pool, id: Uuid) -> Result<Option<Action>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!("SELECT {ACTION_COLS} FROM actions WHERE id = $1"),
            &[&id],
        )
        .await
        .context("failed to query action")?;

    row.map(|r| Action::from_row(&r).map_err(Error::from))
        .transpose()
}

/// Oldest READY action whose target is not cooling down after a recent
/// failure. No claim is made here; claiming happens via the target lock and
/// `action_start_work_on`.
pub async fn action_get_first_ready(
    pool: &Pool,
    error_wait_secs: f64,
) -> Result<Option<Action>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!(
                r#"
                SELECT {ACTION_COLS} FROM actions a
                WHERE a.status = 'READY'
                  AND NOT EXISTS (
                      SELECT 1 FROM actions f
                      WHERE f.target_id = a.target_id
                        AND f.status = 'FAILED'
                        AND f.finished_time > now() - make_interval(secs => $1)
                  )
                ORDER BY a.created_time ASC, a.id ASC
                LIMIT 1
                "#
            ),
            &[&error_wait_secs],
        )
        .await
        .context("failed to scan for ready actions")?;

    row.map(|r| Action::from_row(&r).map_err(Error::from))
        .transpose()
}

pub async fn action_get_all_by_owner(pool: &Pool, owner: Uuid) -> Result<Vec<Action>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!("SELECT {ACTION_COLS} FROM actions WHERE owner = $1"),
            &[&owner],
        )
        .await
        .context("failed to list actions by owner")?;

    rows.iter()
        .map(|r| Action::from_row(r).map_err(Error::from))
        .collect()
}

/// RUNNING actions on `target_id` owned by `owner`. Used to finalize the
/// work of a dead engine after its lock was stolen.
pub async fn action_get_running_on_target(
    pool: &Pool,
    target_id: Uuid,
    owner: Uuid,
) -> Result<Vec<Action>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                "SELECT {ACTION_COLS} FROM actions \
                 WHERE target_id = $1 AND owner = $2 AND status = 'RUNNING'"
            ),
            &[&target_id, &owner],
        )
        .await
        .context("failed to query running actions")?;

    rows.iter()
        .map(|r| Action::from_row(r).map_err(Error::from))
        .collect()
}

struct Edges {
    status: ActionStatus,
    depends_on: Vec<Uuid>,
    depended_by: Vec<Uuid>,
}

async fn read_edges(tx: &Transaction<'_>, id: Uuid) -> Result<Edges> {
    let row = tx
        .query_opt(
            "SELECT status, depends_on, depended_by FROM actions WHERE id = $1 FOR UPDATE",
            &[&id],
        )
        .await
        .context("failed to read action edges")?;
    let Some(row) = row else {
        return Err(Error::not_found("action", id));
    };
    Ok(Edges {
        status: ActionStatus::parse(row.get("status"))?,
        depends_on: ids_from_jsonb(row.get("depends_on")).context("malformed depends_on")?,
        depended_by: ids_from_jsonb(row.get("depended_by")).context("malformed depended_by")?,
    })
}

/// Resolve a (depended, dependent) declaration into (up, down) pairs.
/// Exactly one side may be a list.
fn edge_pairs(depended: &DepRef, dependent: &DepRef) -> Result<Vec<(Uuid, Uuid)>> {
    if depended.is_many() && dependent.is_many() {
        return Err(Error::NotSupported(
            "dependencies between two lists of actions".into(),
        ));
    }
    let mut pairs = Vec::new();
    for up in depended.ids() {
        for down in dependent.ids() {
            pairs.push((up, down));
        }
    }
    Ok(pairs)
}

/// Whether adding `new_edges` (down depends on up) would close a cycle in
/// the dependency graph described by `depends_on`.
fn would_create_cycle(
    depends_on: &HashMap<Uuid, Vec<Uuid>>,
    new_edges: &[(Uuid, Uuid)],
) -> bool {
    // Work on the augmented graph so multi-edge declarations are judged as
    // the atomic unit they are.
    let mut adj: HashMap<Uuid, Vec<Uuid>> = depends_on.clone();
    for (up, down) in new_edges {
        if up == down {
            return true;
        }
        adj.entry(*down).or_default().push(*up);
    }

    // A new cycle must pass through a new edge: check whether any `up` can
    // already reach its `down` by following depends_on links.
    for (up, down) in new_edges {
        let mut stack = vec![*up];
        let mut seen: HashSet<Uuid> = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == *down {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(next) = adj.get(&current) {
                stack.extend(next.iter().copied());
            }
        }
    }
    false
}

async fn load_adjacency(tx: &Transaction<'_>) -> Result<HashMap<Uuid, Vec<Uuid>>> {
    let rows = tx
        .query(
            "SELECT id, depends_on FROM actions \
             WHERE status NOT IN ('SUCCEEDED', 'FAILED', 'CANCELLED')",
            &[],
        )
        .await
        .context("failed to load dependency graph")?;

    let mut adj = HashMap::with_capacity(rows.len());
    for row in &rows {
        let id: Uuid = row.get("id");
        let deps = ids_from_jsonb(row.get("depends_on")).context("malformed depends_on")?;
        adj.insert(id, deps);
    }
    Ok(adj)
}

/// Add dependency edges between existing actions: every dependent gains
/// every depended in `depends_on`, and mirror entries land in
/// `depended_by`, all inside one transaction (or none of it happens).
/// Dependents with outstanding dependencies move to WAITING.
pub async fn action_add_dependency(
    pool: &Pool,
    depended: DepRef,
    dependent: DepRef,
) -> Result<()> {
    let pairs = edge_pairs(&depended, &dependent)?;

    let mut client = pool.get().await.context("failed to get db connection")?;
    let tx = client
        .transaction()
        .await
        .context("failed to start transaction")?;

    let adjacency = load_adjacency(&tx).await?;
    if would_create_cycle(&adjacency, &pairs) {
        tx.rollback().await.context("failed to rollback")?;
        return Err(Error::Invalid(
            "dependency would introduce a cycle".into(),
        ));
    }

    for up in depended.ids() {
        let edges = read_edges(&tx, up).await?;
        let mut depended_by = edges.depended_by;
        for down in dependent.ids() {
            if !depended_by.contains(&down) {
                depended_by.push(down);
            }
        }
        tx.execute(
            "UPDATE actions SET depended_by = $2, updated_time = now() WHERE id = $1",
            &[&up, &ids_to_jsonb(&depended_by)],
        )
        .await
        .context("failed to update depended_by")?;
    }

    for down in dependent.ids() {
        let edges = read_edges(&tx, down).await?;
        let mut depends_on = edges.depends_on;
        for up in depended.ids() {
            if !depends_on.contains(&up) {
                depends_on.push(up);
            }
        }
        tx.execute(
            r#"
            UPDATE actions
            SET depends_on = $2, status = $3, status_reason = $4, updated_time = now()
            WHERE id = $1
            "#,
            &[
                &down,
                &ids_to_jsonb(&depends_on),
                &ActionStatus::Waiting.as_str(),
                &REASON_WAITING,
            ],
        )
        .await
        .context("failed to update depends_on")?;
    }

    tx.commit().await.context("failed to commit transaction")?;
    Ok(())
}

/// Mirror of [`action_add_dependency`]. Dependents whose `depends_on`
/// empties move to READY; their ids are returned so the caller can publish
/// wakeups.
pub async fn action_del_dependency(
    pool: &Pool,
    depended: DepRef,
    dependent: DepRef,
) -> Result<Vec<Uuid>> {
    // Validates the not-both-lists rule up front.
    edge_pairs(&depended, &dependent)?;

    let mut client = pool.get().await.context("failed to get db connection")?;
    let tx = client
        .transaction()
        .await
        .context("failed to start transaction")?;

    let promoted = del_dependency_in_tx(&tx, &depended.ids(), &dependent.ids()).await?;

    tx.commit().await.context("failed to commit transaction")?;
    Ok(promoted)
}

async fn del_dependency_in_tx(
    tx: &Transaction<'_>,
    ups: &[Uuid],
    downs: &[Uuid],
) -> Result<Vec<Uuid>> {
    for up in ups {
        let edges = read_edges(tx, *up).await?;
        let depended_by: Vec<Uuid> = edges
            .depended_by
            .into_iter()
            .filter(|id| !downs.contains(id))
            .collect();
        tx.execute(
            "UPDATE actions SET depended_by = $2, updated_time = now() WHERE id = $1",
            &[up, &ids_to_jsonb(&depended_by)],
        )
        .await
        .context("failed to update depended_by")?;
    }

    let mut promoted = Vec::new();
    for down in downs {
        let edges = read_edges(tx, *down).await?;
        let depends_on: Vec<Uuid> = edges
            .depends_on
            .into_iter()
            .filter(|id| !ups.contains(id))
            .collect();
        let becomes_ready = depends_on.is_empty() && edges.status == ActionStatus::Waiting;
        if becomes_ready {
            tx.execute(
                r#"
                UPDATE actions
                SET depends_on = $2, status = $3, status_reason = $4, updated_time = now()
                WHERE id = $1
                "#,
                &[
                    down,
                    &ids_to_jsonb(&depends_on),
                    &ActionStatus::Ready.as_str(),
                    &REASON_READY,
                ],
            )
            .await
            .context("failed to promote action")?;
            promoted.push(*down);
        } else {
            tx.execute(
                "UPDATE actions SET depends_on = $2, updated_time = now() WHERE id = $1",
                &[down, &ids_to_jsonb(&depends_on)],
            )
            .await
            .context("failed to update depends_on")?;
        }
    }
    Ok(promoted)
}

/// Finalize a successful action: flip it to SUCCEEDED, unlink it from every
/// dependent (possibly promoting them to READY) and clear its own
/// `depended_by`, all in one transaction. Returns the promoted ids.
pub async fn action_mark_succeeded(pool: &Pool, id: Uuid) -> Result<Vec<Uuid>> {
    let mut client = pool.get().await.context("failed to get db connection")?;
    let tx = client
        .transaction()
        .await
        .context("failed to start transaction")?;

    let edges = read_edges(&tx, id).await?;
    tx.execute(
        r#"
        UPDATE actions
        SET status = $2, status_reason = $3, depended_by = '[]',
            updated_time = now(), finished_time = now()
        WHERE id = $1
        "#,
        &[
            &id,
            &ActionStatus::Succeeded.as_str(),
            &"The action completed successfully.",
        ],
    )
    .await
    .context("failed to mark action succeeded")?;

    let promoted = del_dependency_in_tx(&tx, &[id], &edges.depended_by).await?;

    tx.commit().await.context("failed to commit transaction")?;
    Ok(promoted)
}

async fn mark_terminal_cascade(
    pool: &Pool,
    id: Uuid,
    status: ActionStatus,
    reason: &str,
) -> Result<Vec<Uuid>> {
    let mut client = pool.get().await.context("failed to get db connection")?;
    let tx = client
        .transaction()
        .await
        .context("failed to start transaction")?;

    let cascade_reason = format!("Cascaded from depended action {id}.");
    let mut affected = Vec::new();
    let mut stack = vec![(id, truncate_reason(reason))];
    let mut seen: HashSet<Uuid> = HashSet::new();

    while let Some((current, current_reason)) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        let edges = match read_edges(&tx, current).await {
            Ok(edges) => edges,
            // The root must exist; downstream edges may point at rows that
            // were deleted since.
            Err(Error::NotFound { .. }) if current != id => continue,
            Err(e) => {
                tx.rollback().await.context("failed to rollback")?;
                return Err(e);
            }
        };
        if edges.status.is_terminal() {
            continue;
        }
        tx.execute(
            r#"
            UPDATE actions
            SET status = $2, status_reason = $3, updated_time = now(), finished_time = now()
            WHERE id = $1
            "#,
            &[&current, &status.as_str(), &current_reason],
        )
        .await
        .context("failed to mark action terminal")?;
        affected.push(current);
        for child in edges.depended_by {
            stack.push((child, cascade_reason.clone()));
        }
    }

    tx.commit().await.context("failed to commit transaction")?;
    Ok(affected)
}

/// Mark an action FAILED and cascade the failure through its depended-by
/// closure. Returns every action flipped to a terminal state.
pub async fn action_mark_failed(pool: &Pool, id: Uuid, reason: &str) -> Result<Vec<Uuid>> {
    mark_terminal_cascade(pool, id, ActionStatus::Failed, reason).await
}

/// Mark an action CANCELLED and cascade through its depended-by closure.
pub async fn action_mark_cancelled(pool: &Pool, id: Uuid, reason: &str) -> Result<Vec<Uuid>> {
    mark_terminal_cascade(pool, id, ActionStatus::Cancelled, reason).await
}

/// Claim an action: compare-and-update from READY to RUNNING with the
/// caller as owner. Losing the race is a Conflict the dispatcher just
/// shrugs at.
pub async fn action_start_work_on(pool: &Pool, id: Uuid, owner: Uuid) -> Result<Action> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!(
                r#"
                UPDATE actions
                SET owner = $2, status = $3, status_reason = $4, updated_time = now()
                WHERE id = $1 AND status = 'READY'
                RETURNING {ACTION_COLS}
                "#
            ),
            &[&id, &owner, &ActionStatus::Running.as_str(), &REASON_RUNNING],
        )
        .await
        .context("failed to claim action")?;

    match row {
        Some(row) => Action::from_row(&row).map_err(Error::from),
        None => Err(Error::Conflict(format!("action {id} is no longer READY"))),
    }
}

/// Current owner of an action, `None` when unowned. Dispatchers poll this
/// to detect preemption by a lock thief.
pub async fn action_lock_check(pool: &Pool, id: Uuid) -> Result<Option<Uuid>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt("SELECT owner FROM actions WHERE id = $1", &[&id])
        .await
        .context("failed to query action owner")?;

    match row {
        Some(row) => Ok(row.get("owner")),
        None => Err(Error::not_found("action", id)),
    }
}

/// Set (or clear) the control signal on an action. Orthogonal to status;
/// handlers pick it up at their next poll point.
pub async fn action_control(pool: &Pool, id: Uuid, value: Option<ControlSignal>) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    let control = value.map(|v| v.as_str());
    let affected = client
        .execute(
            "UPDATE actions SET control = $2, updated_time = now() WHERE id = $1",
            &[&id, &control],
        )
        .await
        .context("failed to set action control")?;

    if affected == 0 {
        return Err(Error::not_found("action", id));
    }
    Ok(())
}

pub async fn action_control_check(pool: &Pool, id: Uuid) -> Result<Option<ControlSignal>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt("SELECT control FROM actions WHERE id = $1", &[&id])
        .await
        .context("failed to query action control")?;

    let Some(row) = row else {
        return Err(Error::not_found("action", id));
    };
    let control: Option<String> = row.get("control");
    Ok(control
        .as_deref()
        .map(ControlSignal::parse)
        .transpose()
        .map_err(Error::from)?)
}

/// Remove a finished action record. Live actions cannot be deleted.
pub async fn action_delete(pool: &Pool, id: Uuid) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    let affected = client
        .execute(
            "DELETE FROM actions WHERE id = $1 \
             AND status IN ('SUCCEEDED', 'FAILED', 'CANCELLED')",
            &[&id],
        )
        .await
        .context("failed to delete action")?;

    if affected == 0 {
        // Distinguish missing from still-live for the caller.
        match action_get_opt(pool, id).await? {
            Some(_) => Err(Error::Conflict(format!("action {id} has not finished"))),
            None => Err(Error::not_found("action", id)),
        }
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn both_sides_lists_not_supported() {
        let a = ids(2);
        let b = ids(2);
        let err = edge_pairs(&DepRef::Many(a), &DepRef::Many(b)).unwrap_err();
        assert_eq!(err.tag(), "NotSupported");
    }

    #[test]
    fn edge_pairs_form_cartesian_product() {
        let up = Uuid::new_v4();
        let downs = ids(3);
        let pairs = edge_pairs(&DepRef::One(up), &DepRef::Many(downs.clone())).unwrap();
        assert_eq!(pairs.len(), 3);
        assert!(pairs.iter().all(|(u, _)| *u == up));
        assert_eq!(
            pairs.iter().map(|(_, d)| *d).collect::<Vec<_>>(),
            downs
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let a = Uuid::new_v4();
        assert!(would_create_cycle(&HashMap::new(), &[(a, a)]));
    }

    #[test]
    fn simple_cycle_is_detected() {
        let [a, b] = [Uuid::new_v4(), Uuid::new_v4()];
        // b already depends on a; making a depend on b closes the loop.
        let mut adj = HashMap::new();
        adj.insert(b, vec![a]);
        assert!(would_create_cycle(&adj, &[(b, a)]));
        // The reverse direction is fine.
        assert!(!would_create_cycle(&adj, &[(a, b)]));
    }

    #[test]
    fn transitive_cycle_is_detected() {
        let [a, b, c] = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        // c -> b -> a chain; adding a -> c closes it.
        let mut adj = HashMap::new();
        adj.insert(c, vec![b]);
        adj.insert(b, vec![a]);
        assert!(would_create_cycle(&adj, &[(c, a)]));
        assert!(!would_create_cycle(&adj, &[(a, c)]));
    }

    #[test]
    fn cycle_through_sibling_new_edges_is_detected() {
        let [a, b] = [Uuid::new_v4(), Uuid::new_v4()];
        // Both edges are new: a depends on b and b depends on a.
        assert!(would_create_cycle(&HashMap::new(), &[(b, a), (a, b)]));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let [a, b, c, d] = [
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        ];
        let mut adj = HashMap::new();
        adj.insert(b, vec![a]);
        adj.insert(c, vec![a]);
        assert!(!would_create_cycle(&adj, &[(b, d), (c, d)]));
    }
}
