use crate::active_transactions::{ActiveTransactions, TransactionError};
use krpc_encoding::{Envelope, TransactionId};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A future which resolves when the response for `transaction_id` appears
/// in `transactions`, built on `std::future::Future` and a `Waker`
/// rather than a manual poll loop.
pub struct ResponseFuture {
    transaction_id: TransactionId,
    transactions: ActiveTransactions,
}

impl ResponseFuture {
    pub async fn wait_for(
        transaction_id: TransactionId,
        transactions: ActiveTransactions,
    ) -> Result<Envelope, TransactionError> {
        transactions.add_transaction(transaction_id.clone())?;
        ResponseFuture {
            transaction_id,
            transactions,
        }
        .await
    }
}

impl Future for ResponseFuture {
    type Output = Result<Envelope, TransactionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.transactions.poll_response(&self.transaction_id, cx.waker())
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        let _ = self.transactions.drop_transaction(&self.transaction_id);
    }
}
