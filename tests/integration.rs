#[cfg(test)]
mod integration_tests {
    use async_trait::async_trait;
    use ed25519_dalek::SigningKey;
    use keyverify::{
        CancelCode, DeviceStore, Error, EventQueue, InboundEvent, MemoryCrossSigning, MemoryDeviceStore,
        MessageSender, PendingVerificationRequest, RequestState, SendTarget, TransactionMethod, TransactionSnapshot,
        TxState, VerificationConfig, VerificationListener, VerificationMethod, VerificationService, encode_base64,
        init_tracing,
    };
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const ALICE: &str = "@alice:example.org";
    const ALICE_DEVICE: &str = "ALICEDEVICE";
    const BOB: &str = "@bob:example.org";
    const BOB_DEVICE: &str = "BOBDEVICE";
    const BOB_OTHER_DEVICE: &str = "BOBLAPTOP";
    const ROOM: &str = "!dm:example.org";

    const DEVICES: [(&str, &str, u8); 3] = [(ALICE, ALICE_DEVICE, 1), (BOB, BOB_DEVICE, 2), (BOB, BOB_OTHER_DEVICE, 3)];
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn public_key(seed: u8) -> String {
        encode_base64(SigningKey::from_bytes(&[seed; 32]).verifying_key().to_bytes())
    }

    /// Every device's event queue, reachable by user and device id.
    #[derive(Default)]
    struct Network {
        queues: Mutex<Vec<(String, String, EventQueue)>>,
        sent: Mutex<Vec<String>>,
        next_event: AtomicU64,
    }

    impl Network {
        fn sent_count(&self, event_type: &str) -> usize {
            self.sent.lock().unwrap().iter().filter(|t| *t == event_type).count()
        }
    }

    /// Delivers to the queues of the addressed devices, never back to the sender.
    struct RelaySender {
        network: Arc<Network>,
        user_id: String,
        device_id: String,
    }

    #[async_trait]
    impl MessageSender for RelaySender {
        async fn send(&self, event_type: &str, target: &SendTarget, content: Value) -> Result<String, Error> {
            let event_id = format!("$ev{}", self.network.next_event.fetch_add(1, Ordering::SeqCst));
            self.network.sent.lock().unwrap().push(event_type.to_string());

            let queues = self.network.queues.lock().unwrap();
            for (user_id, device_id, queue) in queues.iter() {
                let is_me = *user_id == self.user_id && *device_id == self.device_id;
                let event = match target {
                    SendTarget::Device {
                        user_id: to_user,
                        device_id: to_device,
                    } if to_user == user_id && to_device == device_id => {
                        InboundEvent::to_device(&self.user_id, event_type, content.clone())
                    }
                    SendTarget::Devices {
                        user_id: to_user,
                        device_ids,
                    } if to_user == user_id
                        && (device_ids.contains(device_id) || (device_ids.is_empty() && !is_me)) =>
                    {
                        InboundEvent::to_device(&self.user_id, event_type, content.clone())
                    }
                    SendTarget::Room { room_id } if !is_me => {
                        InboundEvent::in_room(&self.user_id, room_id, &event_id, event_type, content.clone())
                    }
                    _ => continue,
                };
                queue.push(event)?;
            }
            Ok(event_id)
        }
    }

    struct ChannelListener {
        transactions: mpsc::UnboundedSender<TransactionSnapshot>,
        requests: mpsc::UnboundedSender<PendingVerificationRequest>,
    }

    impl VerificationListener for ChannelListener {
        fn transaction_created(&self, transaction: &TransactionSnapshot) {
            let _ = self.transactions.send(transaction.clone());
        }

        fn transaction_updated(&self, transaction: &TransactionSnapshot) {
            let _ = self.transactions.send(transaction.clone());
        }

        fn request_created(&self, request: &PendingVerificationRequest) {
            let _ = self.requests.send(request.clone());
        }

        fn request_updated(&self, request: &PendingVerificationRequest) {
            let _ = self.requests.send(request.clone());
        }
    }

    struct Peer {
        service: VerificationService,
        store: Arc<MemoryDeviceStore>,
        cross_signing: Arc<MemoryCrossSigning>,
        transactions: mpsc::UnboundedReceiver<TransactionSnapshot>,
        requests: mpsc::UnboundedReceiver<PendingVerificationRequest>,
    }

    impl Peer {
        fn join(network: &Arc<Network>, user_id: &str, device_id: &str, config: Option<VerificationConfig>) -> Self {
            let store = Arc::new(MemoryDeviceStore::new());
            for (user, device, seed) in DEVICES {
                store.add_device(user, device, &public_key(seed));
            }
            let cross_signing = Arc::new(MemoryCrossSigning::new());
            let sender = Arc::new(RelaySender {
                network: network.clone(),
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
            });

            let service =
                VerificationService::new(user_id, device_id, sender, store.clone(), cross_signing.clone(), config);
            let (transactions_tx, transactions) = mpsc::unbounded_channel();
            let (requests_tx, requests) = mpsc::unbounded_channel();
            service.add_listener(Arc::new(ChannelListener {
                transactions: transactions_tx,
                requests: requests_tx,
            }));

            network.queues.lock().unwrap().push((
                user_id.to_string(),
                device_id.to_string(),
                EventQueue::spawn(service.clone()),
            ));

            Self {
                service,
                store,
                cross_signing,
                transactions,
                requests,
            }
        }

        /// Waits for a transaction notification matching `pred`.
        async fn transaction(&mut self, pred: impl Fn(&TransactionSnapshot) -> bool) -> TransactionSnapshot {
            let updates = &mut self.transactions;
            tokio::time::timeout(TIMEOUT, async move {
                while let Some(snapshot) = updates.recv().await {
                    if pred(&snapshot) {
                        return Some(snapshot);
                    }
                }
                None
            })
            .await
            .unwrap()
            .unwrap()
        }

        /// Waits for a request notification matching `pred`.
        async fn request(&mut self, pred: impl Fn(&PendingVerificationRequest) -> bool) -> PendingVerificationRequest {
            let updates = &mut self.requests;
            tokio::time::timeout(TIMEOUT, async move {
                while let Some(request) = updates.recv().await {
                    if pred(&request) {
                        return Some(request);
                    }
                }
                None
            })
            .await
            .unwrap()
            .unwrap()
        }
    }

    fn in_state(transaction_id: &str, state: TxState) -> impl Fn(&TransactionSnapshot) -> bool {
        let transaction_id = transaction_id.to_string();
        move |s| s.transaction_id == transaction_id && s.state == state
    }

    async fn confirm_short_codes(alice: &mut Peer, bob: &mut Peer, transaction_id: &str) {
        let alice_code = alice.transaction(in_state(transaction_id, TxState::ShortCodeReady)).await;
        let bob_code = bob.transaction(in_state(transaction_id, TxState::ShortCodeReady)).await;

        println!("Short codes: {:?} / {:?}", alice_code.decimal_code, bob_code.decimal_code);
        assert!(alice_code.decimal_code.is_some());
        assert_eq!(alice_code.decimal_code, bob_code.decimal_code);
        assert!(alice_code.emoji_code.is_some());
        assert_eq!(alice_code.emoji_code, bob_code.emoji_code);

        alice
            .service
            .user_has_verified_short_code(BOB, transaction_id)
            .await
            .unwrap();
        bob.service
            .user_has_verified_short_code(ALICE, transaction_id)
            .await
            .unwrap();

        alice.transaction(in_state(transaction_id, TxState::Verified)).await;
        bob.transaction(in_state(transaction_id, TxState::Verified)).await;
    }

    #[tokio::test]
    async fn test_sas_to_device_end_to_end() {
        init_tracing("keyverify=debug");
        let network = Arc::new(Network::default());

        println!("Step 1: Alice offers curve25519 with hkdf-hmac-sha256 and decimal/emoji...");
        let config = VerificationConfig {
            key_agreement_protocols: vec!["curve25519".to_string()],
            message_authentication_codes: vec!["hkdf-hmac-sha256".to_string()],
            short_authentication_strings: vec!["decimal".to_string(), "emoji".to_string()],
            ..VerificationConfig::default()
        };
        let mut alice = Peer::join(&network, ALICE, ALICE_DEVICE, Some(config));
        let mut bob = Peer::join(&network, BOB, BOB_DEVICE, None);
        let mut bob_laptop = Peer::join(&network, BOB, BOB_OTHER_DEVICE, None);

        println!("Step 2: Alice requests verification from both of Bob's devices...");
        let request = alice
            .service
            .request_verification(
                &[VerificationMethod::Sas],
                BOB,
                &[BOB_DEVICE.to_string(), BOB_OTHER_DEVICE.to_string()],
            )
            .await
            .unwrap();
        let transaction_id = request.transaction_id.clone().unwrap();

        bob.request(|r| r.is_incoming).await;
        bob_laptop.request(|r| r.is_incoming).await;

        println!("Step 3: Bob answers from his phone; the laptop is told to stand down...");
        assert!(
            bob.service
                .ready_pending_verification(&[], ALICE, &transaction_id)
                .await
                .unwrap()
        );
        alice.request(PendingVerificationRequest::is_ready).await;
        let laptop_request = bob_laptop
            .request(|r| r.cancel_conclusion.is_some())
            .await;
        assert_eq!(laptop_request.cancel_conclusion, Some(CancelCode::AcceptedByAnotherDevice));

        println!("Step 4: Alice starts SAS; Bob accepts automatically...");
        alice
            .service
            .begin_verification(VerificationMethod::Sas, BOB, BOB_DEVICE, Some(&transaction_id))
            .await
            .unwrap();
        bob.transaction(in_state(&transaction_id, TxState::SendingAccept)).await;

        println!("Step 5: Both sides compare and confirm the short code...");
        confirm_short_codes(&mut alice, &mut bob, &transaction_id).await;

        println!("Step 6: Checking device trust and request conclusion...");
        assert!(alice.store.is_verified(BOB, BOB_DEVICE));
        assert!(bob.store.is_verified(ALICE, ALICE_DEVICE));
        assert!(!alice.store.is_verified(BOB, BOB_OTHER_DEVICE));

        let request = alice
            .service
            .existing_verification_request(BOB, &transaction_id)
            .await
            .unwrap();
        assert_eq!(request.state(), RequestState::Done);
        assert!(alice.service.existing_transaction(BOB, &transaction_id).await.is_none());
        assert_eq!(network.sent_count("m.key.verification.done"), 0);

        println!("To-device SAS verification passed!");
    }

    #[tokio::test]
    async fn test_sas_in_room_end_to_end() {
        init_tracing("keyverify=debug");
        let network = Arc::new(Network::default());
        let mut alice = Peer::join(&network, ALICE, ALICE_DEVICE, None);
        let mut bob = Peer::join(&network, BOB, BOB_DEVICE, None);
        let mut bob_laptop = Peer::join(&network, BOB, BOB_OTHER_DEVICE, None);

        println!("Step 1: Alice requests verification in the room...");
        let request = alice
            .service
            .request_verification_in_room(&[], BOB, ROOM)
            .await
            .unwrap();
        let transaction_id = request.transaction_id.clone().unwrap();
        assert!(transaction_id.starts_with("$ev"));

        println!("Step 2: Bob's phone answers; his laptop sees it was handled...");
        bob.request(|r| r.room_id.as_deref() == Some(ROOM)).await;
        bob_laptop.request(|r| r.room_id.as_deref() == Some(ROOM)).await;
        assert!(
            bob.service
                .ready_pending_verification(&[], ALICE, &transaction_id)
                .await
                .unwrap()
        );
        alice.request(PendingVerificationRequest::is_ready).await;
        bob_laptop.request(|r| r.handled_by_other_session).await;

        println!("Step 3: Alice starts SAS in the room...");
        alice
            .service
            .begin_verification_in_room(VerificationMethod::Sas, ROOM, BOB, BOB_DEVICE, &transaction_id)
            .await
            .unwrap();

        println!("Step 4: Both sides confirm the short code...");
        confirm_short_codes(&mut alice, &mut bob, &transaction_id).await;
        assert!(alice.store.is_verified(BOB, BOB_DEVICE));
        assert!(bob.store.is_verified(ALICE, ALICE_DEVICE));
        assert!(bob_laptop.service.existing_transaction(ALICE, &transaction_id).await.is_none());

        println!("Step 5: Both sides send done...");
        tokio::time::timeout(TIMEOUT, async {
            while network.sent_count("m.key.verification.done") < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let request = bob
            .service
            .existing_verification_request_in_room(ROOM, &transaction_id)
            .await
            .unwrap();
        assert!(request.is_successful);

        println!("In-room SAS verification passed!");
    }

    #[tokio::test]
    async fn test_second_start_cancels_both_transactions() {
        init_tracing("keyverify=debug");
        let network = Arc::new(Network::default());
        let mut alice = Peer::join(&network, ALICE, ALICE_DEVICE, None);
        let mut bob = Peer::join(&network, BOB, BOB_DEVICE, None);

        println!("Step 1: Alice starts a first verification...");
        let first = alice
            .service
            .begin_verification(VerificationMethod::Sas, BOB, BOB_DEVICE, None)
            .await
            .unwrap();
        bob.transaction(in_state(&first, TxState::OnStarted)).await;

        println!("Step 2: Alice starts a second one while the first is in flight...");
        let second = alice
            .service
            .begin_verification(VerificationMethod::Sas, BOB, BOB_DEVICE, None)
            .await
            .unwrap();
        assert_ne!(first, second);

        println!("Step 3: Both end cancelled with m.unexpected_message...");
        let unexpected = CancelCode::UnexpectedMessage;
        bob.transaction(in_state(&first, TxState::Cancelled(unexpected))).await;
        alice.transaction(in_state(&first, TxState::OnCancelled(unexpected))).await;
        alice.transaction(in_state(&second, TxState::OnCancelled(unexpected))).await;

        assert!(alice.service.existing_transactions_for_user(BOB).await.is_empty());
        assert!(bob.service.existing_transactions_for_user(ALICE).await.is_empty());

        println!("Collision test passed!");
    }

    #[tokio::test]
    async fn test_duplicate_cancel_has_no_effect() {
        init_tracing("keyverify=debug");
        let network = Arc::new(Network::default());
        let mut alice = Peer::join(&network, ALICE, ALICE_DEVICE, None);
        let mut bob = Peer::join(&network, BOB, BOB_DEVICE, None);

        let transaction_id = alice
            .service
            .begin_verification(VerificationMethod::Sas, BOB, BOB_DEVICE, None)
            .await
            .unwrap();
        bob.transaction(in_state(&transaction_id, TxState::OnStarted)).await;

        println!("Bob cancels; Alice sees the peer cancellation...");
        bob.service
            .cancel_transaction(ALICE, &transaction_id, CancelCode::User)
            .await
            .unwrap();
        alice
            .transaction(in_state(&transaction_id, TxState::OnCancelled(CancelCode::User)))
            .await;

        println!("The same cancel delivered again changes nothing...");
        let cancel = json!({
            "transaction_id": transaction_id,
            "code": "m.user",
            "reason": "the user cancelled the verification",
        });
        alice
            .service
            .on_event(InboundEvent::to_device(BOB, "m.key.verification.cancel", cancel))
            .await;
        assert!(
            tokio::time::timeout(Duration::from_millis(100), alice.transactions.recv())
                .await
                .is_err()
        );

        assert_eq!(
            bob.service
                .cancel_transaction(ALICE, &transaction_id, CancelCode::User)
                .await,
            Err(Error::UnknownTransaction)
        );
    }

    #[tokio::test]
    async fn test_declined_request() {
        init_tracing("keyverify=debug");
        let network = Arc::new(Network::default());
        let mut alice = Peer::join(&network, ALICE, ALICE_DEVICE, None);
        let mut bob = Peer::join(&network, BOB, BOB_DEVICE, None);

        let request = alice
            .service
            .request_verification(&[], BOB, &[BOB_DEVICE.to_string()])
            .await
            .unwrap();
        let transaction_id = request.transaction_id.unwrap();

        bob.request(|r| r.is_incoming).await;
        bob.service
            .decline_verification_request(ALICE, &transaction_id)
            .await
            .unwrap();

        let declined = alice.request(|r| r.is_finished()).await;
        assert_eq!(declined.state(), RequestState::Cancelled(CancelCode::User));
    }

    #[tokio::test]
    async fn test_qr_code_between_users() {
        init_tracing("keyverify=debug");
        let network = Arc::new(Network::default());
        let mut alice = Peer::join(&network, ALICE, ALICE_DEVICE, None);
        let mut bob = Peer::join(&network, BOB, BOB_DEVICE, None);

        println!("Step 1: Both users have trusted cross-signing identities...");
        alice.cross_signing.set_my_master_key(&public_key(10));
        alice.cross_signing.add_user_master_key(BOB, &public_key(20));
        bob.cross_signing.set_my_master_key(&public_key(20));
        bob.cross_signing.add_user_master_key(ALICE, &public_key(10));

        println!("Step 2: Alice requests; QR methods are advertised...");
        let request = alice
            .service
            .request_verification(&[], BOB, &[BOB_DEVICE.to_string()])
            .await
            .unwrap();
        let transaction_id = request.transaction_id.clone().unwrap();
        let methods = request.request_info.unwrap().methods;
        assert!(methods.contains(&"m.qr_code.show.v1".to_string()));
        assert!(methods.contains(&"m.reciprocate.v1".to_string()));

        println!("Step 3: Bob readies; both sides prepare a QR transaction...");
        bob.request(|r| r.is_incoming).await;
        assert!(
            bob.service
                .ready_pending_verification(&[], ALICE, &transaction_id)
                .await
                .unwrap()
        );
        let shown = alice
            .transaction(|s| s.method == TransactionMethod::QrCode && s.qr_code_text.is_some())
            .await;

        println!("Step 4: Bob scans Alice's code...");
        bob.service
            .user_has_scanned_other_qr_code(ALICE, &transaction_id, &shown.qr_code_text.unwrap())
            .await
            .unwrap();

        println!("Step 5: Alice confirms Bob scanned it...");
        alice
            .transaction(in_state(&transaction_id, TxState::QrScannedByOther))
            .await;
        alice
            .service
            .other_user_scanned_my_qr_code(BOB, &transaction_id)
            .await
            .unwrap();

        alice.transaction(in_state(&transaction_id, TxState::Verified)).await;
        bob.transaction(in_state(&transaction_id, TxState::Verified)).await;

        println!("Step 6: Each side now trusts the other's master key...");
        assert!(alice.cross_signing.is_user_trusted(BOB));
        assert!(bob.cross_signing.is_user_trusted(ALICE));
        assert_eq!(
            bob.service
                .existing_verification_request(ALICE, &transaction_id)
                .await
                .unwrap()
                .state(),
            RequestState::Done
        );

        println!("QR code verification passed!");
    }
}
