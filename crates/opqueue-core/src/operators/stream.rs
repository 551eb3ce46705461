//! Operator output: one value or a finite stream of items.
//!
//! A stream produced by [`ExecutionStream::spawn`] owns its producer task.
//! Once the channel closes, [`ExecutionStream::finish`] reports how that task
//! ended, so a producer that fails or panics halfway never reads as success.

use std::future::Future;

use anyhow::anyhow;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::ProgressStatus;

/// One item of a streaming operator's output.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionItem {
    Progress(ProgressStatus),
    Value(Value),
}

/// Push-style, non-restartable stream. Ends when every sender is dropped.
#[derive(Debug)]
pub struct ExecutionStream {
    rx: mpsc::Receiver<ExecutionItem>,
    producer: Option<JoinHandle<anyhow::Result<()>>>,
}

impl ExecutionStream {
    /// Run `produce` on its own task, feeding a bounded channel.
    ///
    /// An `Err` returned by the producer, or a panic inside it, surfaces from
    /// [`finish`](Self::finish) after the items it did send.
    pub fn spawn<F, Fut>(buffer: usize, produce: F) -> ExecutionStream
    where
        F: FnOnce(StreamSender) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let producer = tokio::spawn(produce(StreamSender { tx }));
        ExecutionStream {
            rx,
            producer: Some(producer),
        }
    }

    /// A stream over items that are already known.
    pub fn from_items(items: Vec<ExecutionItem>) -> Self {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            // Capacity covers every item.
            let _ = tx.try_send(item);
        }
        ExecutionStream { rx, producer: None }
    }

    pub async fn next(&mut self) -> Option<ExecutionItem> {
        self.rx.recv().await
    }

    /// How the producer ended. Call after `next` returned `None`; items still
    /// buffered are discarded.
    pub async fn finish(mut self) -> anyhow::Result<()> {
        self.rx.close();
        let Some(producer) = self.producer.take() else {
            return Ok(());
        };
        match producer.await {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_panic() => Err(anyhow!(
                "stream producer panicked: {}",
                crate::app::executor::panic_message(join_err.into_panic())
            )),
            Err(_) => Err(anyhow!("stream producer was cancelled")),
        }
    }
}

impl Drop for ExecutionStream {
    fn drop(&mut self) {
        if let Some(producer) = &self.producer {
            producer.abort();
        }
    }
}

/// Producer side of an `ExecutionStream`.
#[derive(Debug, Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<ExecutionItem>,
}

impl StreamSender {
    pub async fn value(&self, value: Value) -> anyhow::Result<()> {
        self.send(ExecutionItem::Value(value)).await
    }

    pub async fn progress(&self, progress: Option<f64>, label: Option<&str>) -> anyhow::Result<()> {
        let status = ProgressStatus::new(progress, label.map(str::to_string));
        self.send(ExecutionItem::Progress(status)).await
    }

    pub async fn send(&self, item: ExecutionItem) -> anyhow::Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| anyhow::anyhow!("execution stream receiver dropped"))
    }
}

/// What `Operator::execute` returns.
#[derive(Debug)]
pub enum OperatorOutput {
    Empty,
    Value(Value),
    Stream(ExecutionStream),
}

impl From<Value> for OperatorOutput {
    fn from(value: Value) -> Self {
        OperatorOutput::Value(value)
    }
}
