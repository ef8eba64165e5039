//! Integration tests for access grants, group keys and attributes

mod common;

use std::time::Duration;

use vault::prelude::*;

#[tokio::test]
async fn test_grant_read_shares_existing_keys() {
    common::init_tracing();
    let env = common::TestEnv::new();
    let alice = SecretKey::generate();
    let bob = SecretKey::generate();

    let vault = env.create(Realm::users(), &alice).await;
    vault
        .write("before.txt", "written before the grant", &[], IoMode::Sync)
        .await
        .unwrap();

    let err = env
        .builder(Realm::users(), &bob)
        .await
        .open()
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Unauthorized(_)));

    vault
        .sync_access(&[(bob.public(), Access::READ)], IoMode::Sync)
        .await
        .unwrap();

    let shared = env.open(Realm::users(), &bob).await;
    assert_eq!(shared.access(&bob.public()).await.unwrap(), Access::READ);
    assert_eq!(shared.author().await.unwrap(), alice.public());
    let accesses = shared.accesses().await.unwrap();
    assert_eq!(accesses.get(&bob.public()), Some(&Access::READ));
    assert_eq!(accesses.len(), 2);

    assert_eq!(
        shared.read("before.txt").await.unwrap(),
        "written before the grant"
    );
    assert_eq!(shared.author_of("before.txt").await.unwrap(), alice.public());
    assert_eq!(
        shared.key_id_of("before.txt").await.unwrap(),
        vault.key_id_of("before.txt").await.unwrap()
    );
}

#[tokio::test]
async fn test_reader_cannot_write_or_grant() {
    let env = common::TestEnv::new();
    let alice = SecretKey::generate();
    let bob = SecretKey::generate();
    let carol = SecretKey::generate();

    let vault = env.create(Realm::users(), &alice).await;
    vault
        .sync_access(&[(bob.public(), Access::READ)], IoMode::Sync)
        .await
        .unwrap();
    let shared = env.open(Realm::users(), &bob).await;

    let err = shared.write("x.txt", "x", &[], IoMode::Sync).await.unwrap_err();
    assert!(matches!(err, VaultError::Unauthorized(_)));
    let err = shared
        .sync_access(&[(carol.public(), Access::READ)], IoMode::Sync)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Unauthorized(_)));
    let err = shared.set_config(Config::default(), IoMode::Sync).await.unwrap_err();
    assert!(matches!(err, VaultError::Unauthorized(_)));
}

#[tokio::test]
async fn test_revoke_rotates_key() {
    let env = common::TestEnv::new();
    let alice = SecretKey::generate();
    let bob = SecretKey::generate();

    let vault = env.create(Realm::users(), &alice).await;
    vault
        .sync_access(&[(bob.public(), Access::READ_WRITE)], IoMode::Sync)
        .await
        .unwrap();
    vault.write("old.txt", "old secret", &[], IoMode::Sync).await.unwrap();
    let old_key = vault.key_id_of("old.txt").await.unwrap();

    let shared = env.open(Realm::users(), &bob).await;
    assert_eq!(shared.read("old.txt").await.unwrap(), "old secret");

    vault
        .sync_access(&[(bob.public(), Access::NONE)], IoMode::Sync)
        .await
        .unwrap();
    vault.write("new.txt", "new secret", &[], IoMode::Sync).await.unwrap();
    let new_key = vault.key_id_of("new.txt").await.unwrap();
    assert_ne!(old_key, new_key);

    shared.sync_ledger().await.unwrap();
    assert!(shared.access(&bob.public()).await.unwrap().is_none());
    let report = shared.sync().await.unwrap();
    assert_eq!(report.new_files, 0);
    assert_eq!(report.skipped, 1);

    // history stays readable, new writes do not
    assert_eq!(shared.read("old.txt").await.unwrap(), "old secret");
    assert!(shared.stat("new.txt").await.unwrap_err().is_not_found());
    let err = shared.write("late.txt", "x", &[], IoMode::Sync).await.unwrap_err();
    assert!(matches!(err, VaultError::Unauthorized(_)));

    let err = env
        .builder(Realm::users(), &bob)
        .await
        .open()
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Unauthorized(_)));
}

#[tokio::test]
async fn test_attributes() {
    let env = common::TestEnv::new();
    let alice = SecretKey::generate();
    let bob = SecretKey::generate();
    let vault = env.create(Realm::users(), &alice).await;

    vault
        .set_attribute("email", "alice@example.com", IoMode::Sync)
        .await
        .unwrap();
    vault
        .set_attribute("nick", "al", IoMode::Sync)
        .await
        .unwrap();

    let me = alice.public();
    let attributes = vault.attributes(&me).await.unwrap();
    assert_eq!(attributes.len(), 2);
    assert_eq!(
        vault.attribute(&me, "email").await.unwrap().as_deref(),
        Some("alice@example.com")
    );
    assert_eq!(vault.attribute(&me, "nick").await.unwrap().as_deref(), Some("al"));
    assert_eq!(vault.attribute(&me, "phone").await.unwrap(), None);

    vault
        .sync_access(&[(bob.public(), Access::READ)], IoMode::Sync)
        .await
        .unwrap();
    let shared = env.open(Realm::users(), &bob).await;
    assert_eq!(shared.attributes(&me).await.unwrap(), attributes);
}

#[tokio::test]
async fn test_deferred_changes_share_a_block() {
    let env = common::TestEnv::new();
    let alice = SecretKey::generate();
    let vault = env.create(Realm::users(), &alice).await;
    let height = vault.ledger_height().await.unwrap();

    vault.set_attribute("a", "1", IoMode::Deferred).await.unwrap();
    vault.set_attribute("b", "2", IoMode::Deferred).await.unwrap();
    assert_eq!(vault.ledger_height().await.unwrap(), height);
    assert_eq!(vault.attribute(&alice.public(), "a").await.unwrap(), None);

    vault.flush().await.unwrap();
    assert_eq!(vault.ledger_height().await.unwrap(), height + 1);
    assert_eq!(vault.attributes(&alice.public()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_async_access_change() {
    let env = common::TestEnv::new();
    let alice = SecretKey::generate();
    let bob = SecretKey::generate();
    let vault = env.create(Realm::users(), &alice).await;
    let height = vault.ledger_height().await.unwrap();

    vault
        .sync_access(&[(bob.public(), Access::READ)], IoMode::Async)
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while vault.ledger_height().await.unwrap() == height {
        assert!(tokio::time::Instant::now() < deadline, "ledger never exported");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(vault.access(&bob.public()).await.unwrap(), Access::READ);
}

#[tokio::test]
async fn test_config_travels_through_ledger() {
    let env = common::TestEnv::new();
    let alice = SecretKey::generate();
    let vault = env.create(Realm::users(), &alice).await;

    let config = Config {
        max_storage: 4096,
        retention: Duration::from_secs(3600),
        ..Config::default()
    };
    vault.set_config(config.clone(), IoMode::Sync).await.unwrap();
    assert_eq!(vault.config(), config);

    let other = env.open(Realm::users(), &alice).await;
    assert_eq!(other.config(), config);

    let bad = Config {
        sync_relay: Some("http://relay.example.com".into()),
        ..Config::default()
    };
    let err = vault.set_config(bad, IoMode::Sync).await.unwrap_err();
    assert!(matches!(err, VaultError::Config(_)));
}
