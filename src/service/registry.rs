use crate::PendingVerificationRequest;
use crate::transaction::{TransactionMethod, VerificationTransaction};
use std::collections::{HashMap, VecDeque};

/// Transactions and requests of one service, keyed by peer user.
///
/// Terminal transactions are evicted; their ids are remembered for a while
/// so late messages can be told apart from unknown ones. Finished requests
/// are kept up to the same bound per user.
pub(super) struct Registry {
    transactions: HashMap<String, HashMap<String, VerificationTransaction>>,
    requests: HashMap<String, Vec<PendingVerificationRequest>>,
    past: VecDeque<(String, String)>,
    max_past: usize,
    next_generation: u64,
}

impl Registry {
    pub(super) fn new(max_past: usize) -> Self {
        Self {
            transactions: HashMap::new(),
            requests: HashMap::new(),
            past: VecDeque::new(),
            max_past,
            next_generation: 0,
        }
    }

    pub(super) fn transaction(&self, other_user_id: &str, transaction_id: &str) -> Option<&VerificationTransaction> {
        self.transactions.get(other_user_id)?.get(transaction_id)
    }

    pub(super) fn transaction_mut(
        &mut self,
        other_user_id: &str,
        transaction_id: &str,
    ) -> Option<&mut VerificationTransaction> {
        self.transactions.get_mut(other_user_id)?.get_mut(transaction_id)
    }

    pub(super) fn transactions_for_user(&self, other_user_id: &str) -> impl Iterator<Item = &VerificationTransaction> {
        self.transactions
            .get(other_user_id)
            .into_iter()
            .flat_map(|txs| txs.values())
    }

    /// Ids of the SAS transactions in flight with a user.
    pub(super) fn active_sas_ids(&self, other_user_id: &str) -> Vec<String> {
        self.transactions_for_user(other_user_id)
            .filter(|tx| tx.method() == TransactionMethod::Sas && !tx.state().is_terminal())
            .map(|tx| tx.transaction_id().to_string())
            .collect()
    }

    /// Inserts a transaction under a fresh generation, replacing one with the
    /// same id.
    pub(super) fn insert_transaction(
        &mut self,
        mut transaction: VerificationTransaction,
    ) -> Option<VerificationTransaction> {
        self.next_generation += 1;
        transaction.set_generation(self.next_generation);
        self.transactions
            .entry(transaction.other_user_id().to_string())
            .or_default()
            .insert(transaction.transaction_id().to_string(), transaction)
    }

    /// Removes a transaction whose id stays in use.
    pub(super) fn remove_transaction(
        &mut self,
        other_user_id: &str,
        transaction_id: &str,
    ) -> Option<VerificationTransaction> {
        let txs = self.transactions.get_mut(other_user_id)?;
        let removed = txs.remove(transaction_id);
        if txs.is_empty() {
            self.transactions.remove(other_user_id);
        }
        removed
    }

    /// Removes a transaction and remembers its id.
    pub(super) fn evict(&mut self, other_user_id: &str, transaction_id: &str) -> Option<VerificationTransaction> {
        let removed = self.remove_transaction(other_user_id, transaction_id);
        if removed.is_some() {
            self.past.push_back((other_user_id.to_string(), transaction_id.to_string()));
            while self.past.len() > self.max_past {
                self.past.pop_front();
            }
        }
        removed
    }

    /// Whether the transaction existed and was evicted recently.
    pub(super) fn is_past(&self, other_user_id: &str, transaction_id: &str) -> bool {
        self.past
            .iter()
            .any(|(user, id)| user == other_user_id && id == transaction_id)
    }

    pub(super) fn requests_for_user(&self, other_user_id: &str) -> &[PendingVerificationRequest] {
        self.requests.get(other_user_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub(super) fn request(&self, other_user_id: &str, transaction_id: &str) -> Option<&PendingVerificationRequest> {
        self.requests_for_user(other_user_id)
            .iter()
            .find(|r| r.matches(transaction_id))
    }

    pub(super) fn request_in_room(&self, room_id: &str, transaction_id: &str) -> Option<&PendingVerificationRequest> {
        self.requests
            .values()
            .flatten()
            .find(|r| r.room_id.as_deref() == Some(room_id) && r.matches(transaction_id))
    }

    pub(super) fn add_request(&mut self, request: PendingVerificationRequest) {
        let other_user_id = request.other_user_id.clone();
        self.requests.entry(other_user_id.clone()).or_default().push(request);
        self.prune_requests(&other_user_id);
    }

    /// Drops the oldest finished requests of a user beyond the bound.
    fn prune_requests(&mut self, other_user_id: &str) {
        let max_past = self.max_past;
        let Some(requests) = self.requests.get_mut(other_user_id) else {
            return;
        };
        let mut finished = requests.iter().filter(|r| r.is_finished()).count();
        requests.retain(|r| {
            if finished > max_past && r.is_finished() {
                finished -= 1;
                false
            } else {
                true
            }
        });
    }

    /// Applies `update` to the request with the given local id and returns
    /// the updated copy.
    pub(super) fn update_request(
        &mut self,
        other_user_id: &str,
        local_id: &str,
        update: impl FnOnce(&mut PendingVerificationRequest),
    ) -> Option<PendingVerificationRequest> {
        let request = self
            .requests
            .get_mut(other_user_id)?
            .iter_mut()
            .find(|r| r.local_id == local_id)?;
        update(request);
        let updated = request.clone();
        self.prune_requests(other_user_id);
        Some(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::tests::{ALICE, ALICE_DEVICE, BOB, BOB_DEVICE, offer, params, store};
    use std::sync::Arc;

    fn transaction(id: &str) -> VerificationTransaction {
        let mut params = params((ALICE, ALICE_DEVICE), (BOB, Some(BOB_DEVICE)), store(), Arc::default());
        params.transaction_id = id.to_string();
        VerificationTransaction::new_outgoing_sas(params, offer())
    }

    #[test]
    fn test_evicted_ids_are_remembered_up_to_bound() {
        let mut registry = Registry::new(2);
        for id in ["a", "b", "c"] {
            registry.insert_transaction(transaction(id));
        }
        assert_eq!(registry.active_sas_ids(BOB).len(), 3);

        for id in ["a", "b", "c"] {
            assert!(registry.evict(BOB, id).is_some());
        }
        assert!(registry.transaction(BOB, "a").is_none());
        assert!(!registry.is_past(BOB, "a"));
        assert!(registry.is_past(BOB, "b"));
        assert!(registry.is_past(BOB, "c"));
        assert!(registry.evict(BOB, "c").is_none());
    }

    #[test]
    fn test_replaced_transaction_gets_new_generation() {
        let mut registry = Registry::new(2);
        registry.insert_transaction(transaction("a"));
        let first = registry.transaction(BOB, "a").unwrap().generation();

        let replaced = registry.insert_transaction(transaction("a")).unwrap();
        assert_eq!(replaced.generation(), first);
        assert_ne!(registry.transaction(BOB, "a").unwrap().generation(), first);

        assert!(registry.remove_transaction(BOB, "a").is_some());
        assert!(!registry.is_past(BOB, "a"));
    }

    #[test]
    fn test_finished_requests_are_bounded() {
        let mut registry = Registry::new(2);
        for id in ["r1", "r2", "r3", "r4"] {
            let mut request = PendingVerificationRequest::outgoing(id, BOB, None);
            request.transaction_id = Some(id.to_string());
            registry.add_request(request);
            registry.update_request(BOB, id, |r| r.is_successful = true);
        }
        let mut pending = PendingVerificationRequest::outgoing("r5", BOB, None);
        pending.transaction_id = Some("r5".to_string());
        registry.add_request(pending);

        let ids: Vec<&str> = registry
            .requests_for_user(BOB)
            .iter()
            .map(|r| r.local_id.as_str())
            .collect();
        assert_eq!(ids, ["r3", "r4", "r5"]);
    }

    #[test]
    fn test_request_lookup_and_update() {
        let mut registry = Registry::new(10);
        let mut request = PendingVerificationRequest::outgoing("local", BOB, Some("!room"));
        request.transaction_id = Some("$event".to_string());
        registry.add_request(request);

        assert!(registry.request(BOB, "$event").is_some());
        assert!(registry.request_in_room("!room", "$event").is_some());
        assert!(registry.request_in_room("!other", "$event").is_none());

        let updated = registry
            .update_request(BOB, "local", |r| r.is_successful = true)
            .unwrap();
        assert!(updated.is_finished());
        assert!(registry.update_request(BOB, "missing", |_| {}).is_none());
    }
}
