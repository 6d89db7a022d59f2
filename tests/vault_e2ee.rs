use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use vaultsync::config::Config;
use vaultsync::conflict::ConflictStrategy;
use vaultsync::engine::Engine;
use vaultsync::errors::{sync_error_kind, SyncError};
use vaultsync::events::VaultEvent;
use vaultsync::remote::Remote;
use vaultsync::vault_lock::{CipherBoundary, Keychain};
use vaultsync::vfs::{DiskVfs, Vfs};

fn temp_dir(tag: &str) -> PathBuf {
    let mut root = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    root.push(format!("vaultsync-e2ee-{tag}-{nanos}"));
    std::fs::create_dir_all(&root).unwrap();
    root
}

fn encrypted_device(tag: &str, remote: Remote, keychain: Keychain) -> Engine {
    let dir = temp_dir(tag);
    let cfg = Config {
        vault_dir: dir,
        device_id: format!("device-{tag}"),
        concurrency: 4,
        strategy: ConflictStrategy::SmartMerge,
        e2ee: true,
        sync_interval_secs: 60,
        config_path: None,
    };
    let vfs: Arc<dyn Vfs> = Arc::new(DiskVfs::new(&cfg.vault_dir));
    let cipher = CipherBoundary::enabled(Arc::new(Mutex::new(keychain)));
    Engine::new(cfg, vfs, remote, cipher).unwrap()
}

/// The remote stores only ciphertext; a second device holding the same
/// master key gets the plaintext back.
#[tokio::test]
async fn remote_sees_ciphertext_and_peers_decrypt() {
    let (remote, cloud) = Remote::memory();

    let mut kc_a = Keychain::new();
    let blob = kc_a.initialize_new_vault("a strong password").unwrap();
    let mut kc_b = Keychain::new();
    kc_b.unlock_vault(&blob, "a strong password").unwrap();

    let mut a = encrypted_device("a", remote.clone(), kc_a);
    let mut b = encrypted_device("b", remote.clone(), kc_b);

    let plaintext = b"private thoughts\nnobody else reads\n";
    std::fs::write(a.cfg().vault_dir.join("secret.md"), plaintext).unwrap();
    a.apply_event(&VaultEvent::Created("secret.md".into()));
    a.smart_sync(false).await.unwrap();

    let stored = cloud.bytes_at("secret.md").unwrap();
    assert_ne!(stored, plaintext.to_vec());
    assert!(
        !stored
            .windows(b"private".len())
            .any(|w| w == b"private"),
        "ciphertext leaked plaintext"
    );
    // Index tracks the ciphertext identity, what the remote actually holds.
    let entry = a.index().get("secret.md").unwrap();
    assert_eq!(entry.hash, vaultsync::codec::md5_hex(&stored));
    assert_eq!(entry.size, stored.len() as u64);

    b.smart_sync(false).await.unwrap();
    assert_eq!(
        std::fs::read(b.cfg().vault_dir.join("secret.md")).unwrap(),
        plaintext
    );
}

/// Scenario 5: rotation keeps existing ciphertext valid, the new lock file
/// opens only under the new password.
#[tokio::test]
async fn password_rotation_preserves_data() {
    let mut kc = Keychain::new();
    let _blob_v1 = kc.initialize_new_vault("password-one").unwrap();
    let encrypted = kc.encrypt(b"survives rotation").unwrap();

    let blob_v2 = kc.update_password("password-two").unwrap();

    let mut reopened = Keychain::new();
    reopened.unlock_vault(&blob_v2, "password-two").unwrap();
    assert_eq!(reopened.decrypt(&encrypted).unwrap(), b"survives rotation");

    let mut stale = Keychain::new();
    let err = stale.unlock_vault(&blob_v2, "password-one").unwrap_err();
    assert!(matches!(
        sync_error_kind(&err),
        Some(SyncError::InvalidPassword)
    ));
}

/// Recovery round trip across devices: export on one, recover on another,
/// both decrypt the same remote bytes.
#[tokio::test]
async fn recovery_code_round_trip_across_devices() {
    let (remote, _cloud) = Remote::memory();

    let mut kc_a = Keychain::new();
    kc_a.initialize_new_vault("first password").unwrap();
    let code = kc_a.export_recovery_code().unwrap();
    let fingerprint = kc_a.key_fingerprint().unwrap();

    let mut a = encrypted_device("ra", remote.clone(), kc_a);
    std::fs::write(a.cfg().vault_dir.join("keep.md"), b"recovered data\n").unwrap();
    a.apply_event(&VaultEvent::Created("keep.md".into()));
    a.smart_sync(false).await.unwrap();

    let mut kc_b = Keychain::new();
    let new_blob = kc_b.recover_from_code(&code, "second password").unwrap();
    assert_eq!(kc_b.key_fingerprint().unwrap(), fingerprint);

    // The recovered lock file honors only the new password.
    let mut kc_check = Keychain::new();
    kc_check.unlock_vault(&new_blob, "second password").unwrap();

    let mut b = encrypted_device("rb", remote.clone(), kc_b);
    b.smart_sync(false).await.unwrap();
    assert_eq!(
        std::fs::read(b.cfg().vault_dir.join("keep.md")).unwrap(),
        b"recovered data\n"
    );
}

/// A locked keychain pauses sync with `Locked` instead of moving bytes.
#[tokio::test]
async fn locked_vault_refuses_to_sync() {
    let (remote, cloud) = Remote::memory();

    let mut kc_a = Keychain::new();
    kc_a.initialize_new_vault("a strong password").unwrap();
    let mut a = encrypted_device("la", remote.clone(), kc_a);
    std::fs::write(a.cfg().vault_dir.join("secret.md"), b"hidden\n").unwrap();
    a.apply_event(&VaultEvent::Created("secret.md".into()));
    a.smart_sync(false).await.unwrap();
    assert!(cloud.bytes_at("secret.md").is_some());

    // Device with E2EE configured but no key resident.
    let mut locked = encrypted_device("ll", remote.clone(), Keychain::new());
    let err = locked.smart_sync(false).await.unwrap_err();
    assert!(matches!(sync_error_kind(&err), Some(SyncError::Locked)));
    assert!(!locked.cfg().vault_dir.join("secret.md").exists());
}
