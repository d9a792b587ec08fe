use super::link::ClusterLink;
use crate::fabric::protocol::{Notice, Question};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::Value;

/// Asks every member and collects the answers in member order.
/// A failed ask shows up as `None`.
pub async fn gather(
    link: &dyn ClusterLink,
    question: Question,
    data: Value,
) -> Vec<(String, Option<Value>)> {
    let asks = link.member_keys().into_iter().map(|peer| {
        let ask = link.ask(&peer, question, data.clone());
        async move {
            match ask.await {
                Ok(answer) => (peer, Some(answer)),
                Err(e) => {
                    tracing::warn!("{} to {} got no answer: {}", question, peer, e);
                    (peer, None)
                }
            }
        }
    });
    futures::future::join_all(asks).await
}

/// Asks every member and returns the first non-empty answer, ignoring the rest.
pub async fn race(
    link: &dyn ClusterLink,
    question: Question,
    data: Value,
) -> Option<(String, Value)> {
    let mut asks: FuturesUnordered<_> = link
        .member_keys()
        .into_iter()
        .map(|peer| {
            let ask = link.ask(&peer, question, data.clone());
            async move { (peer, ask.await) }
        })
        .collect();

    while let Some((peer, result)) = asks.next().await {
        match result {
            Ok(answer) if is_present(&answer) => return Some((peer, answer)),
            Ok(_) => {}
            Err(e) => tracing::debug!("{} to {} failed: {}", question, peer, e),
        }
    }
    None
}

/// Sends a notice to every member. Delivery failures are logged and skipped.
pub fn notify_all(link: &dyn ClusterLink, notice: Notice, data: Value) {
    for peer in link.member_keys() {
        if let Err(e) = link.notify(&peer, notice, data.clone()) {
            tracing::warn!("{} to {} not sent: {}", notice, peer, e);
        }
    }
}

/// `null`, `false` and `""` count as "no answer".
pub fn is_present(answer: &Value) -> bool {
    match answer {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}
