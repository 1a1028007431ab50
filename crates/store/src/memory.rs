use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::watch;

use super::error::{
    DuplicateKeySnafu, ForeignKeySnafu, MissingColumnSnafu, StoreResult, TransportSnafu,
    UnknownRpcSnafu,
};
use super::realtime::{InsertFanout, Subscription};
use super::types::{
    ACCEPT_INVITE_RPC, Filter, InviteAcceptance, Order, Row, Table, check_order, conflict_column,
    now_timestamp, prepare_filters, prepare_insert, prepare_patch,
};
use super::{BoxFuture, RemoteStore, lock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Select,
    Insert,
    Upsert,
    Rpc,
    Subscribe,
}

/// One recorded call, kept so tests can assert on backend traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreCall {
    pub op: StoreOp,
    pub table: Option<Table>,
    pub filters: Vec<Filter>,
}

#[derive(Debug)]
struct InjectedFailure {
    op: StoreOp,
    table: Option<Table>,
    details: String,
}

#[derive(Debug)]
struct HoldSlot {
    id: u64,
    op: StoreOp,
    table: Table,
    filters: Vec<Filter>,
    reached: watch::Sender<bool>,
    release: watch::Receiver<bool>,
}

impl HoldSlot {
    fn matches(&self, op: StoreOp, table: Table, filters: &[Filter]) -> bool {
        self.op == op
            && self.table == table
            && self.filters.len() == filters.len()
            && self.filters.iter().all(|filter| filters.contains(filter))
    }
}

#[derive(Default)]
struct MemoryInner {
    tables: Mutex<HashMap<Table, Vec<Row>>>,
    fanout: InsertFanout,
    failures: Mutex<Vec<InjectedFailure>>,
    holds: Mutex<Vec<HoldSlot>>,
    calls: Mutex<Vec<StoreCall>>,
    next_hold_id: AtomicU64,
}

/// In-memory store with the same validation rules as the sqlite backend.
///
/// Besides serving as an embedded backend it carries the hooks race tests need: injected
/// failures, call holds and a call log.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

/// Parks every matching select or subscribe call until released or dropped.
pub struct CallHold {
    id: u64,
    reached: watch::Receiver<bool>,
    release: watch::Sender<bool>,
    store: Weak<MemoryInner>,
}

impl CallHold {
    /// Resolves once a matching call is parked on this hold.
    pub async fn reached(&mut self) {
        let _ = self.reached.wait_for(|reached| *reached).await;
    }

    pub fn release(self) {}
}

impl Drop for CallHold {
    fn drop(&mut self) {
        self.release.send_replace(true);
        if let Some(store) = self.store.upgrade() {
            lock(&store.holds).retain(|slot| slot.id != self.id);
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next call of `op` (optionally restricted to one table) with a transport error.
    pub fn fail_next(&self, op: StoreOp, table: Option<Table>, details: impl Into<String>) {
        lock(&self.inner.failures).push(InjectedFailure {
            op,
            table,
            details: details.into(),
        });
    }

    pub fn hold_select(&self, table: Table, filters: Vec<Filter>) -> CallHold {
        self.hold(StoreOp::Select, table, filters)
    }

    pub fn hold_subscribe(&self, table: Table, filters: Vec<Filter>) -> CallHold {
        self.hold(StoreOp::Subscribe, table, filters)
    }

    fn hold(&self, op: StoreOp, table: Table, filters: Vec<Filter>) -> CallHold {
        let id = self.inner.next_hold_id.fetch_add(1, Ordering::Relaxed);
        let (reached_tx, reached_rx) = watch::channel(false);
        let (release_tx, release_rx) = watch::channel(false);
        lock(&self.inner.holds).push(HoldSlot {
            id,
            op,
            table,
            filters,
            reached: reached_tx,
            release: release_rx,
        });

        CallHold {
            id,
            reached: reached_rx,
            release: release_tx,
            store: Arc::downgrade(&self.inner),
        }
    }

    pub fn rows(&self, table: Table) -> Vec<Row> {
        lock(&self.inner.tables)
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        lock(&self.inner.calls).clone()
    }

    pub fn count_calls(&self, op: StoreOp, table: Table) -> usize {
        lock(&self.inner.calls)
            .iter()
            .filter(|call| call.op == op && call.table == Some(table))
            .count()
    }

    pub fn subscriber_count(&self, table: Table) -> usize {
        self.inner.fanout.active_subscribers(table)
    }

    fn record(&self, op: StoreOp, table: Option<Table>, filters: &[Filter]) {
        lock(&self.inner.calls).push(StoreCall {
            op,
            table,
            filters: filters.to_vec(),
        });
    }

    fn take_failure(
        &self,
        op: StoreOp,
        table: Option<Table>,
        stage: &'static str,
    ) -> StoreResult<()> {
        let mut failures = lock(&self.inner.failures);
        let position = failures.iter().position(|failure| {
            failure.op == op && (failure.table.is_none() || failure.table == table)
        });

        match position {
            Some(position) => {
                let failure = failures.remove(position);
                TransportSnafu {
                    stage,
                    details: failure.details,
                }
                .fail()
            }
            None => Ok(()),
        }
    }

    async fn wait_for_hold(&self, op: StoreOp, table: Table, filters: &[Filter]) {
        let release = {
            let holds = lock(&self.inner.holds);
            holds
                .iter()
                .find(|slot| slot.matches(op, table, filters))
                .map(|slot| {
                    slot.reached.send_replace(true);
                    slot.release.clone()
                })
        };

        if let Some(mut release) = release {
            let _ = release.wait_for(|released| *released).await;
        }
    }

    fn accept_invite(&self, args: Value) -> StoreResult<Value> {
        let acceptance = InviteAcceptance::from_args(args, "memory-rpc-accept-invite-args")?;
        let mut tables = lock(&self.inner.tables);
        let invite = tables.entry(Table::Invites).or_default().iter_mut().find(|row| {
            row.get("token").and_then(Value::as_str) == Some(acceptance.p_token.as_str())
                && row.get("accepted_by").is_none_or(Value::is_null)
        });

        let Some(invite) = invite else {
            return Ok(Value::Bool(false));
        };
        invite.insert("accepted_by".to_string(), acceptance.p_user_id.into());
        invite.insert("accepted_at".to_string(), Value::String(now_timestamp()));
        Ok(Value::Bool(true))
    }
}

fn check_unique(
    tables: &HashMap<Table, Vec<Row>>,
    table: Table,
    row: &Row,
    stage: &'static str,
) -> StoreResult<()> {
    let key = table.primary_key();
    let duplicate = tables.get(&table).is_some_and(|rows| {
        rows.iter()
            .any(|existing| existing.get(key.name) == row.get(key.name))
    });

    if duplicate {
        return DuplicateKeySnafu {
            stage,
            table,
            column: key.name,
        }
        .fail();
    }
    Ok(())
}

fn check_references(
    tables: &HashMap<Table, Vec<Row>>,
    table: Table,
    row: &Row,
    stage: &'static str,
) -> StoreResult<()> {
    for column in table.columns() {
        let Some(referenced) = column.references else {
            continue;
        };
        let Some(value) = row.get(column.name).filter(|value| !value.is_null()) else {
            continue;
        };

        let key = referenced.primary_key();
        let exists = tables.get(&referenced).is_some_and(|rows| {
            rows.iter()
                .any(|candidate| candidate.get(key.name) == Some(value))
        });
        if !exists {
            return ForeignKeySnafu {
                stage,
                table,
                column: column.name,
                referenced,
            }
            .fail();
        }
    }
    Ok(())
}

impl RemoteStore for MemoryStore {
    fn select<'a>(
        &'a self,
        table: Table,
        filters: Vec<Filter>,
        order: Option<Order>,
    ) -> BoxFuture<'a, StoreResult<Vec<Row>>> {
        Box::pin(async move {
            self.record(StoreOp::Select, Some(table), &filters);
            self.take_failure(StoreOp::Select, Some(table), "memory-select")?;
            let filters = prepare_filters(table, filters, "memory-select-filters")?;
            if let Some(order) = &order {
                check_order(table, order, "memory-select-order")?;
            }

            self.wait_for_hold(StoreOp::Select, table, &filters).await;

            let mut rows = lock(&self.inner.tables)
                .get(&table)
                .map(|rows| {
                    rows.iter()
                        .filter(|row| filters.iter().all(|filter| filter.matches(row)))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            if let Some(order) = order {
                rows.sort_by(|left, right| order.compare(left, right));
            }
            Ok(rows)
        })
    }

    fn insert<'a>(&'a self, table: Table, row: Row) -> BoxFuture<'a, StoreResult<Row>> {
        Box::pin(async move {
            self.record(StoreOp::Insert, Some(table), &[]);
            self.take_failure(StoreOp::Insert, Some(table), "memory-insert")?;
            let row = prepare_insert(table, row, "memory-insert-prepare")?;

            {
                let mut tables = lock(&self.inner.tables);
                check_unique(&tables, table, &row, "memory-insert-unique")?;
                check_references(&tables, table, &row, "memory-insert-references")?;
                tables.entry(table).or_default().push(row.clone());
            }

            self.inner.fanout.publish(table, &row);
            Ok(row)
        })
    }

    fn upsert<'a>(
        &'a self,
        table: Table,
        row: Row,
        conflict_key: &'a str,
    ) -> BoxFuture<'a, StoreResult<Row>> {
        Box::pin(async move {
            self.record(StoreOp::Upsert, Some(table), &[]);
            self.take_failure(StoreOp::Upsert, Some(table), "memory-upsert")?;
            let key = conflict_column(table, conflict_key, "memory-upsert-conflict-key")?;
            let patch = prepare_patch(table, row, "memory-upsert-prepare")?;
            let Some(key_value) = patch.get(key.name).cloned() else {
                return MissingColumnSnafu {
                    stage: "memory-upsert-key",
                    table,
                    column: key.name,
                }
                .fail();
            };

            let (row, inserted) = {
                let mut tables = lock(&self.inner.tables);
                let existing = tables
                    .entry(table)
                    .or_default()
                    .iter_mut()
                    .find(|candidate| candidate.get(key.name) == Some(&key_value));

                match existing {
                    Some(existing) => {
                        for (column, value) in patch {
                            existing.insert(column, value);
                        }
                        (existing.clone(), false)
                    }
                    None => {
                        let row = prepare_insert(table, patch, "memory-upsert-insert")?;
                        check_references(&tables, table, &row, "memory-upsert-references")?;
                        tables.entry(table).or_default().push(row.clone());
                        (row, true)
                    }
                }
            };

            if inserted {
                self.inner.fanout.publish(table, &row);
            }
            Ok(row)
        })
    }

    fn rpc<'a>(&'a self, name: &'a str, args: Value) -> BoxFuture<'a, StoreResult<Value>> {
        Box::pin(async move {
            self.record(StoreOp::Rpc, None, &[]);
            self.take_failure(StoreOp::Rpc, None, "memory-rpc")?;

            match name {
                ACCEPT_INVITE_RPC => self.accept_invite(args),
                _ => UnknownRpcSnafu {
                    stage: "memory-rpc-lookup",
                    name,
                }
                .fail(),
            }
        })
    }

    fn subscribe_to_inserts<'a>(
        &'a self,
        table: Table,
        filters: Vec<Filter>,
    ) -> BoxFuture<'a, StoreResult<Subscription>> {
        Box::pin(async move {
            self.record(StoreOp::Subscribe, Some(table), &filters);
            self.take_failure(StoreOp::Subscribe, Some(table), "memory-subscribe")?;
            let filters = prepare_filters(table, filters, "memory-subscribe-filters")?;
            self.wait_for_hold(StoreOp::Subscribe, table, &filters).await;
            Ok(self.inner.fanout.subscribe(table, filters))
        })
    }
}
