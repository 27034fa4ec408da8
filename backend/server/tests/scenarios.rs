//! End-to-end scenarios over the service layer, from registration through
//! CI key retrieval, against an in-memory database.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use envlock_server::errors::ApiError;
use envlock_server::models::RequestMeta;
use envlock_server::services::envs::{self, CiGetEnvRequest, GetEnvRequest, ListVersionsRequest, PushEnvRequest};
use envlock_server::services::projects::{
    self, AddUserRequest, CreateProjectRequest, SetAccessRequest,
};
use envlock_server::services::rotation::{
    self, NewWrappedDek, RotateCommitRequest, RotateInitRequest, RotateInitResponse,
    WrappedKeyEntry,
};
use envlock_server::services::service_roles::{self, CreateServiceRoleRequest, DelegateRequest};
use envlock_server::services::sessions::{self, ProjectKeysRequest, VerifiedClaims};
use envlock_server::services::snapshots::{self, ExportRequest, ImportRequest};
use envlock_server::services::users::{self, RegisterRequest};

async fn pool() -> SqlitePool {
    // One connection: each pooled connection would otherwise get its own
    // empty :memory: database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn meta() -> RequestMeta {
    RequestMeta {
        request_id: "scenario".to_string(),
        ip: Some("127.0.0.1".to_string()),
        user_agent: Some("envlock-tests".to_string()),
    }
}

async fn register(pool: &SqlitePool, email: &str) -> Uuid {
    users::register(pool, &meta(), RegisterRequest {
        email: email.to_string(),
        password: "a strong password".to_string(),
        public_key: email.as_bytes().to_vec(),
        enc_private_key: vec![0x01],
        enc_private_key_salt: vec![0x02],
        enc_private_key_nonce: vec![0x03],
    })
    .await
    .unwrap()
    .user_id
}

async fn create_project(pool: &SqlitePool, owner: Uuid, name: &str, wrapped_prk: Vec<u8>) -> Uuid {
    projects::create(pool, &meta(), owner, CreateProjectRequest {
        name: name.to_string(),
        wrapped_prk,
        wrap_nonce: vec![0x0B],
        ephemeral_public_key: vec![0x0E],
    })
    .await
    .unwrap()
    .project_id
}

fn push_req(project: Uuid, env: &str, ciphertext: Vec<u8>) -> PushEnvRequest {
    PushEnvRequest {
        project_id: project,
        env_name: env.to_string(),
        ciphertext,
        nonce: vec![0x11],
        wrapped_dek: vec![0xD0],
        dek_nonce: vec![0x12],
        encryption_version: 1,
        metadata: None,
    }
}

fn rewrap(user_id: Uuid, bytes: Vec<u8>) -> WrappedKeyEntry {
    WrappedKeyEntry {
        user_id,
        wrapped_prk: bytes,
        wrap_nonce: vec![0x21],
        ephemeral_public_key: vec![0x22],
    }
}

fn redek(init: &RotateInitResponse, byte: u8) -> Vec<NewWrappedDek> {
    init.wrapped_deks
        .iter()
        .map(|d| NewWrappedDek {
            env_version_id: d.env_version_id,
            new_wrapped_dek: vec![byte],
            new_dek_nonce: vec![byte, byte],
        })
        .collect()
}

// S1 — Happy push/pull.
#[tokio::test]
async fn s1_happy_push_pull() {
    let pool = pool().await;
    let alice = register(&pool, "alice@example.com").await;
    let project = create_project(&pool, alice, "P", vec![0xAA, 0xAA]).await;

    let pushed = envs::push(&pool, &meta(), alice, push_req(project, "prod", vec![0xC0, 0xDE]))
        .await
        .unwrap();
    assert_eq!(pushed.version, 1);

    let pulled = envs::get(&pool, &meta(), alice, GetEnvRequest {
        project_id: project,
        env_name: "prod".to_string(),
        version: None,
    })
    .await
    .unwrap();
    assert_eq!(pulled.version, 1);
    assert_eq!(pulled.ciphertext, vec![0xC0, 0xDE]);
}

// S2 — Add member then rotate; stale commit conflicts.
#[tokio::test]
async fn s2_add_member_then_rotate() {
    let pool = pool().await;
    let alice = register(&pool, "alice@example.com").await;
    let bob = register(&pool, "bob@example.com").await;
    let project = create_project(&pool, alice, "P", vec![0xAA, 0xAA]).await;
    envs::push(&pool, &meta(), alice, push_req(project, "prod", vec![0xC0]))
        .await
        .unwrap();

    projects::add_user(&pool, &meta(), alice, AddUserRequest {
        project_name: "P".to_string(),
        user_id: bob,
        wrapped_prk: vec![0xBB, 0xBB],
        wrap_nonce: vec![1],
        ephemeral_public_key: vec![2],
    })
    .await
    .unwrap();

    let init = rotation::init(&pool, &meta(), alice, RotateInitRequest { project_id: project })
        .await
        .unwrap();
    assert_eq!(init.prk_version, 1);
    assert_eq!(init.member_public_keys.len(), 2);
    assert_eq!(init.wrapped_prks.len(), 2);

    let committed = rotation::commit(&pool, &meta(), alice, RotateCommitRequest {
        project_id: project,
        expected_prk_version: 1,
        new_wrapped_prks: vec![rewrap(alice, vec![0xA1, 0xA1]), rewrap(bob, vec![0xB1, 0xB1])],
        new_wrapped_deks: redek(&init, 0xD1),
    })
    .await
    .unwrap();
    assert_eq!(committed.new_prk_version, 2);

    let err = rotation::commit(&pool, &meta(), alice, RotateCommitRequest {
        project_id: project,
        expected_prk_version: 1,
        new_wrapped_prks: vec![rewrap(alice, vec![0xA2]), rewrap(bob, vec![0xB2])],
        new_wrapped_deks: redek(&init, 0xD2),
    })
    .await
    .unwrap_err();
    assert_eq!(err.code(), "VERSION_CONFLICT");
}

// S3 — Revocation denies reads but keeps the wrapped key row.
#[tokio::test]
async fn s3_revoke() {
    let pool = pool().await;
    let alice = register(&pool, "alice@example.com").await;
    let bob = register(&pool, "bob@example.com").await;
    let project = create_project(&pool, alice, "P", vec![0xAA]).await;
    projects::add_user(&pool, &meta(), alice, AddUserRequest {
        project_name: "P".to_string(),
        user_id: bob,
        wrapped_prk: vec![0xBB],
        wrap_nonce: vec![1],
        ephemeral_public_key: vec![2],
    })
    .await
    .unwrap();
    envs::push(&pool, &meta(), alice, push_req(project, "prod", vec![0xC0]))
        .await
        .unwrap();

    projects::set_access(&pool, &meta(), alice, SetAccessRequest {
        project_name: "P".to_string(),
        user_email: "bob@example.com".to_string(),
        is_revoked: true,
    })
    .await
    .unwrap();

    let err = envs::get(&pool, &meta(), bob, GetEnvRequest {
        project_id: project,
        env_name: "prod".to_string(),
        version: None,
    })
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::Forbidden { .. }));

    let (rows,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM wrapped_prks WHERE project_id = ?1 AND user_id = ?2",
    )
    .bind(project)
    .bind(bob)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(rows, 1);
}

// S4 — Snapshot round trip; tampered checksum rejected.
#[tokio::test]
async fn s4_snapshot_round_trip() {
    let pool = pool().await;
    let alice = register(&pool, "alice@example.com").await;
    let project = create_project(&pool, alice, "P", vec![0xAA, 0xAA]).await;
    envs::push(&pool, &meta(), alice, push_req(project, "prod", vec![0xC0, 0xDE]))
        .await
        .unwrap();
    envs::push(&pool, &meta(), alice, push_req(project, "prod", vec![0xBE, 0xEF]))
        .await
        .unwrap();

    let exported = snapshots::export(&pool, &meta(), alice, ExportRequest {
        project_name: "P".to_string(),
    })
    .await
    .unwrap();
    assert_eq!(
        exported.checksum,
        snapshots::checksum(&exported.snapshot).unwrap()
    );

    let imported = snapshots::import(&pool, &meta(), alice, ImportRequest {
        new_project_name: "P2".to_string(),
        snapshot: exported.snapshot.clone(),
        checksum: exported.checksum.clone(),
    })
    .await
    .unwrap();
    assert_ne!(imported.new_project_id, project);

    // The copy's versions match the original byte for byte.
    let original = envs::list_versions(&pool, alice, ListVersionsRequest {
        project_id: project,
        env_name: "prod".to_string(),
    })
    .await
    .unwrap();
    let copy = envs::list_versions(&pool, alice, ListVersionsRequest {
        project_id: imported.new_project_id,
        env_name: "prod".to_string(),
    })
    .await
    .unwrap();
    assert_eq!(original.env_versions.len(), copy.env_versions.len());
    for (a, b) in original.env_versions.iter().zip(copy.env_versions.iter()) {
        assert_eq!(a.version, b.version);
        assert_eq!(a.ciphertext, b.ciphertext);
        assert_eq!(a.nonce, b.nonce);
        assert_eq!(a.wrapped_dek, b.wrapped_dek);
        assert_eq!(a.dek_nonce, b.dek_nonce);
        assert_eq!(a.created_at, b.created_at);
    }

    // A re-export of the copy differs only in name and env-version ids.
    let re_exported = snapshots::export(&pool, &meta(), alice, ExportRequest {
        project_name: "P2".to_string(),
    })
    .await
    .unwrap();
    assert_eq!(re_exported.snapshot.metadata.prk_version, exported.snapshot.metadata.prk_version);
    assert_eq!(re_exported.snapshot.members.len(), exported.snapshot.members.len());
    for (a, b) in re_exported
        .snapshot
        .members
        .iter()
        .zip(exported.snapshot.members.iter())
    {
        assert_eq!(a.user_id, b.user_id);
        assert_eq!(a.wrapped_prk, b.wrapped_prk);
    }

    // Flip the last hex character of the checksum.
    let mut tampered = exported.checksum.clone().into_bytes();
    let last = tampered.last_mut().unwrap();
    *last = if *last == b'0' { b'1' } else { b'0' };
    let tampered = String::from_utf8(tampered).unwrap();

    let err = snapshots::import(&pool, &meta(), alice, ImportRequest {
        new_project_name: "P3".to_string(),
        snapshot: exported.snapshot.clone(),
        checksum: tampered,
    })
    .await
    .unwrap_err();
    assert_eq!(err.code(), "CHECKSUM_MISMATCH");

    // Tampering with the snapshot body fails the same way.
    let mut corrupted = exported.snapshot.clone();
    corrupted.env_versions[0].ciphertext[0] ^= 0x01;
    let err = snapshots::import(&pool, &meta(), alice, ImportRequest {
        new_project_name: "P3".to_string(),
        snapshot: corrupted,
        checksum: exported.checksum,
    })
    .await
    .unwrap_err();
    assert_eq!(err.code(), "CHECKSUM_MISMATCH");
}

// S5 — CI flow: delegation, OIDC login, scoped key retrieval.
#[tokio::test]
async fn s5_ci_flow() {
    let pool = pool().await;
    let alice = register(&pool, "alice@example.com").await;
    let project = create_project(&pool, alice, "P", vec![0xAA]).await;
    envs::push(&pool, &meta(), alice, push_req(project, "prod", vec![0xC0, 0xDE]))
        .await
        .unwrap();

    service_roles::create(&pool, &meta(), alice, CreateServiceRoleRequest {
        service_role_name: "deployer".to_string(),
        service_role_public_key: vec![0x51],
        repo_principal: "org/repo".to_string(),
    })
    .await
    .unwrap();

    service_roles::delegate(&pool, &meta(), alice, DelegateRequest {
        project_id: project,
        env_name: "prod".to_string(),
        repo_principal: "org/repo".to_string(),
        wrapped_prk: vec![0xDD, 0xDD],
        wrap_nonce: vec![1],
        ephemeral_public_key: vec![2],
    })
    .await
    .unwrap();

    let login = sessions::oidc_login(&pool, &meta(), VerifiedClaims {
        subject: "repo:org/repo:ref:refs/heads/main".to_string(),
        repository: "org/repo".to_string(),
        git_ref: Some("refs/heads/main".to_string()),
        issuer: Some("https://token.actions.githubusercontent.com".to_string()),
    })
    .await
    .unwrap();
    assert_eq!(login.project_id, project);

    let keys = sessions::get_project_keys(&pool, &meta(), ProjectKeysRequest {
        session_id: login.session_id,
        project_id: project,
        env_name: "prod".to_string(),
    })
    .await
    .unwrap();
    assert_eq!(keys.wrapped_prk, vec![0xDD, 0xDD]);

    let err = sessions::get_project_keys(&pool, &meta(), ProjectKeysRequest {
        session_id: login.session_id,
        project_id: project,
        env_name: "staging".to_string(),
    })
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::Forbidden { .. }));

    // The CI read serves the latest version of the delegated env.
    let env = envs::ci_get(&pool, &meta(), CiGetEnvRequest {
        session_id: login.session_id,
    })
    .await
    .unwrap();
    assert_eq!(env.ciphertext, vec![0xC0, 0xDE]);

    let err = sessions::get_project_keys(&pool, &meta(), ProjectKeysRequest {
        session_id: Uuid::new_v4(),
        project_id: project,
        env_name: "prod".to_string(),
    })
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::NotFound { .. }));
}

// S6 — Concurrent rotation: exactly one commit wins, no partial rewrap.
#[tokio::test]
async fn s6_concurrent_rotation() {
    let pool = pool().await;
    let alice = register(&pool, "alice@example.com").await;
    let project = create_project(&pool, alice, "P", vec![0xAA]).await;
    envs::push(&pool, &meta(), alice, push_req(project, "prod", vec![0xC0]))
        .await
        .unwrap();

    // Walk the project up to prk_version 5.
    for _ in 0..4 {
        let init = rotation::init(&pool, &meta(), alice, RotateInitRequest { project_id: project })
            .await
            .unwrap();
        rotation::commit(&pool, &meta(), alice, RotateCommitRequest {
            project_id: project,
            expected_prk_version: init.prk_version,
            new_wrapped_prks: vec![rewrap(alice, vec![0xA0])],
            new_wrapped_deks: redek(&init, 0xD0),
        })
        .await
        .unwrap();
    }

    // Two clients init at version 5 and both build a full rewrap.
    let init_a = rotation::init(&pool, &meta(), alice, RotateInitRequest { project_id: project })
        .await
        .unwrap();
    let init_b = rotation::init(&pool, &meta(), alice, RotateInitRequest { project_id: project })
        .await
        .unwrap();
    assert_eq!(init_a.prk_version, 5);
    assert_eq!(init_b.prk_version, 5);

    let won = rotation::commit(&pool, &meta(), alice, RotateCommitRequest {
        project_id: project,
        expected_prk_version: 5,
        new_wrapped_prks: vec![rewrap(alice, vec![0x1A])],
        new_wrapped_deks: redek(&init_a, 0x1D),
    })
    .await
    .unwrap();
    assert_eq!(won.new_prk_version, 6);

    let lost = rotation::commit(&pool, &meta(), alice, RotateCommitRequest {
        project_id: project,
        expected_prk_version: 5,
        new_wrapped_prks: vec![rewrap(alice, vec![0x2A])],
        new_wrapped_deks: redek(&init_b, 0x2D),
    })
    .await
    .unwrap_err();
    assert_eq!(lost.code(), "VERSION_CONFLICT");

    // Only the winner's material is visible.
    let after = rotation::init(&pool, &meta(), alice, RotateInitRequest { project_id: project })
        .await
        .unwrap();
    assert_eq!(after.prk_version, 6);
    assert_eq!(after.wrapped_prks[0].wrapped_prk, vec![0x1A]);
    assert_eq!(after.wrapped_deks[0].wrapped_dek, vec![0x1D]);
}

// Boundary: a session user importing a snapshot is always the actor; the
// payload cannot name someone else (it carries no user id at all).
#[tokio::test]
async fn import_rejects_unknown_members() {
    let pool = pool().await;
    let alice = register(&pool, "alice@example.com").await;
    create_project(&pool, alice, "P", vec![0xAA]).await;

    let mut exported = snapshots::export(&pool, &meta(), alice, ExportRequest {
        project_name: "P".to_string(),
    })
    .await
    .unwrap();

    // Swap the member for a user this server has never seen.
    exported.snapshot.members[0].user_id = Uuid::new_v4();
    let checksum = snapshots::checksum(&exported.snapshot).unwrap();

    let err = snapshots::import(&pool, &meta(), alice, ImportRequest {
        new_project_name: "P2".to_string(),
        snapshot: exported.snapshot,
        checksum,
    })
    .await
    .unwrap_err();
    assert_eq!(err.code(), "SNAPSHOT_UNKNOWN_MEMBER");
}
