use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use super::lock;
use super::types::{Filter, Row, Table};

/// Signal that a row matching a subscription was inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertNotification {
    pub table: Table,
    pub row: Row,
}

/// Live insert subscription, consumed as a [`Stream`]. Dropping it (or calling
/// [`Subscription::unsubscribe`]) stops delivery; anything still buffered is discarded with it.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::UnboundedReceiver<InsertNotification>,
}

impl Subscription {
    pub fn new(events: mpsc::UnboundedReceiver<InsertNotification>) -> Self {
        Self { events }
    }

    pub fn unsubscribe(mut self) {
        self.events.close();
    }
}

impl Stream for Subscription {
    type Item = InsertNotification;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

#[derive(Debug)]
struct Subscriber {
    table: Table,
    filters: Vec<Filter>,
    events: mpsc::UnboundedSender<InsertNotification>,
}

/// In-process insert fan-out shared by the embedded backends.
#[derive(Debug, Default)]
pub(crate) struct InsertFanout {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl InsertFanout {
    pub(crate) fn subscribe(&self, table: Table, filters: Vec<Filter>) -> Subscription {
        let (events, receiver) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(Subscriber {
            table,
            filters,
            events,
        });
        Subscription::new(receiver)
    }

    pub(crate) fn publish(&self, table: Table, row: &Row) -> usize {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|subscriber| !subscriber.events.is_closed());

        let mut delivered = 0;
        for subscriber in subscribers.iter().filter(|subscriber| {
            subscriber.table == table && subscriber.filters.iter().all(|filter| filter.matches(row))
        }) {
            let notification = InsertNotification {
                table,
                row: row.clone(),
            };
            if subscriber.events.send(notification).is_ok() {
                delivered += 1;
            }
        }

        tracing::debug!("fanned out insert on {table} to {delivered} subscriber(s)");
        delivered
    }

    pub(crate) fn active_subscribers(&self, table: Table) -> usize {
        lock(&self.subscribers)
            .iter()
            .filter(|subscriber| subscriber.table == table && !subscriber.events.is_closed())
            .count()
    }
}
