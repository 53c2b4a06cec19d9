//! Identity resolver state machine: canonicalization, directory enrichment,
//! bind codes, preauth keys, personal-bot guard, membership policy.

mod init_logging;

use std::sync::Arc;
use std::time::Duration;

use courier::adapter::mock::{inbound_text, MockAdapter};
use courier::{
    BotProfile, ChannelConfig, ChannelType, DirectoryEntry, IdentityResolver, IdentityStore,
    InMemoryIdentityStore, Registry, Resolution,
};
use serde_json::json;

struct Fixture {
    store: Arc<InMemoryIdentityStore>,
    registry: Arc<Registry>,
    resolver: IdentityResolver,
    config: ChannelConfig,
}

fn fixture_with(adapter: MockAdapter) -> Fixture {
    let store = Arc::new(InMemoryIdentityStore::new());
    let registry = Arc::new(Registry::new());
    registry.register(Arc::new(adapter));
    let resolver = IdentityResolver::new(Arc::clone(&store) as _, Arc::clone(&registry));
    Fixture {
        store,
        registry,
        resolver,
        config: ChannelConfig::new("cfg-1", "bot-1", ChannelType::new("mock")),
    }
}

fn fixture() -> Fixture {
    fixture_with(MockAdapter::new("mock").with_sender())
}

fn open_profile(store: &InMemoryIdentityStore, bot_id: &str) {
    store.put_bot_profile(BotProfile {
        bot_id: bot_id.into(),
        kind: courier::BotKind::Shared,
        owner_user_id: None,
        allow_guests: true,
    });
}

#[tokio::test]
async fn guest_passes_and_acts_as_own_user() {
    let f = fixture();
    open_profile(&f.store, "bot-1");
    let msg = inbound_text("mock", "bot-1", "p2p", "u-9", "hello");
    match f.resolver.resolve(&f.config, &msg).await.unwrap() {
        Resolution::Pass(identity) => {
            assert_eq!(identity.bot_id, "bot-1");
            assert_eq!(identity.channel_config_id, "cfg-1");
            // Unlinked sender: the channel identity acts as the user.
            assert_eq!(identity.user_id, identity.channel_identity_id);
            // Guests pass without a membership upsert.
            assert!(!f
                .store
                .is_member("bot-1", &identity.user_id)
                .await
                .unwrap());
        }
        Resolution::Stop(_) => panic!("guest should pass on a guest-friendly bot"),
    }
}

#[tokio::test]
async fn members_only_denies_with_reply_in_direct_silence_in_group() {
    let f = fixture();
    f.store.put_bot_profile(BotProfile::shared("bot-1"));

    let direct = inbound_text("mock", "bot-1", "p2p", "u-9", "hello");
    match f.resolver.resolve(&f.config, &direct).await.unwrap() {
        Resolution::Stop(decision) => assert!(decision.reply.is_some(), "direct denial replies"),
        Resolution::Pass(_) => panic!("non-member must stop"),
    }

    let group = inbound_text("mock", "bot-1", "group", "u-9", "hello");
    match f.resolver.resolve(&f.config, &group).await.unwrap() {
        Resolution::Stop(decision) => assert!(decision.reply.is_none(), "group denial is silent"),
        Resolution::Pass(_) => panic!("non-member must stop"),
    }
}

#[tokio::test]
async fn bind_code_crosses_bots_and_links_identity() {
    let f = fixture();
    // Issued by human H against bot-1; consumed in a message addressed to bot-2.
    let code = f.store.issue_bind_code(
        ChannelType::new("mock"),
        "bot-1",
        "human-h",
        Duration::from_secs(600),
    );
    let config_b2 = ChannelConfig::new("cfg-2", "bot-2", ChannelType::new("mock"));
    let msg = inbound_text("mock", "bot-2", "p2p", "shadow-1", &code.token);

    match f.resolver.resolve(&config_b2, &msg).await.unwrap() {
        Resolution::Stop(decision) => assert!(decision.reply.is_some()),
        Resolution::Pass(_) => panic!("bind consumption must stop the pipeline"),
    }

    // Consumed exactly once; shadow identity linked to the issuer.
    assert!(f.store.find_live_bind_code(&code.token).await.unwrap().is_none());
    let identity = f
        .store
        .find_identity(&ChannelType::new("mock"), "shadow-1")
        .await
        .unwrap()
        .expect("identity upserted");
    assert_eq!(identity.user_id.as_deref(), Some("human-h"));
    // No membership upsert on either bot.
    assert!(!f.store.is_member("bot-1", "human-h").await.unwrap());
    assert!(!f.store.is_member("bot-2", "human-h").await.unwrap());
}

#[tokio::test]
async fn bind_code_precedes_membership_shortcut() {
    let f = fixture();
    open_profile(&f.store, "bot-1");
    // The shadow identity is already a member; a bind code must still consume.
    let identity = f
        .store
        .upsert_channel_identity(
            &ChannelType::new("mock"),
            "subject-m",
            "Member",
            &serde_json::Map::new(),
        )
        .await
        .unwrap();
    f.store.add_member("bot-1", &identity.id);

    let code = f.store.issue_bind_code(
        ChannelType::new("mock"),
        "bot-1",
        "human-h",
        Duration::from_secs(600),
    );
    let msg = inbound_text("mock", "bot-1", "p2p", "subject-m", &code.token);
    match f.resolver.resolve(&f.config, &msg).await.unwrap() {
        Resolution::Stop(_) => {}
        Resolution::Pass(_) => panic!("bind code must run before membership shortcut"),
    }
    let linked = f
        .store
        .find_identity(&ChannelType::new("mock"), "subject-m")
        .await
        .unwrap()
        .expect("identity present");
    assert_eq!(linked.user_id.as_deref(), Some("human-h"));
}

#[tokio::test]
async fn expired_bind_code_stops_without_consumption() {
    let f = fixture();
    let code = f.store.issue_bind_code(
        ChannelType::new("mock"),
        "bot-1",
        "human-h",
        Duration::from_secs(600),
    );
    f.store.expire_bind_code(&code.token);

    let msg = inbound_text("mock", "bot-1", "p2p", "u-9", &code.token);
    match f.resolver.resolve(&f.config, &msg).await.unwrap() {
        Resolution::Stop(decision) => assert!(decision.reply.is_none(), "expired code: silent"),
        Resolution::Pass(_) => panic!("expired code must stop"),
    }
    // Still live (unconsumed).
    assert!(f.store.find_live_bind_code(&code.token).await.unwrap().is_some());
}

#[tokio::test]
async fn platform_mismatched_bind_code_stops_without_consumption() {
    let f = fixture();
    let code = f.store.issue_bind_code(
        ChannelType::new("otherplatform"),
        "bot-1",
        "human-h",
        Duration::from_secs(600),
    );
    let msg = inbound_text("mock", "bot-1", "p2p", "u-9", &code.token);
    match f.resolver.resolve(&f.config, &msg).await.unwrap() {
        Resolution::Stop(_) => {}
        Resolution::Pass(_) => panic!("mismatched code must stop"),
    }
    assert!(f.store.find_live_bind_code(&code.token).await.unwrap().is_some());
}

#[tokio::test]
async fn preauth_key_grants_membership() {
    let f = fixture();
    let key = f.store.issue_preauth_key("bot-1", Duration::from_secs(600));
    let msg = inbound_text("mock", "bot-1", "p2p", "u-9", &key.key);
    match f.resolver.resolve(&f.config, &msg).await.unwrap() {
        Resolution::Stop(decision) => assert!(decision.reply.is_some()),
        Resolution::Pass(_) => panic!("preauth consumption must stop the pipeline"),
    }
    let identity = f
        .store
        .find_identity(&ChannelType::new("mock"), "u-9")
        .await
        .unwrap()
        .expect("identity upserted");
    assert!(f.store.is_member("bot-1", &identity.id).await.unwrap());
    // Key is one-shot.
    let again = inbound_text("mock", "bot-1", "p2p", "u-10", &key.key);
    f.store.put_bot_profile(BotProfile::shared("bot-1"));
    match f.resolver.resolve(&f.config, &again).await.unwrap() {
        Resolution::Stop(decision) => {
            // Used key falls through to the membership gate.
            assert!(decision.reply.is_some());
        }
        Resolution::Pass(_) => panic!("used key must not grant again"),
    }
}

#[tokio::test]
async fn personal_bot_direct_owner_passes_with_force_reply() {
    let f = fixture();
    f.store
        .put_bot_profile(BotProfile::personal("bot-1", "owner-1"));
    let identity = f
        .store
        .upsert_channel_identity(
            &ChannelType::new("mock"),
            "subject-o",
            "Owner",
            &serde_json::Map::new(),
        )
        .await
        .unwrap();
    f.store
        .link_identity_to_user(&identity.id, "owner-1")
        .await
        .unwrap();

    let direct = inbound_text("mock", "bot-1", "p2p", "subject-o", "hi");
    match f.resolver.resolve(&f.config, &direct).await.unwrap() {
        Resolution::Pass(resolved) => {
            assert_eq!(resolved.user_id, "owner-1");
            assert!(resolved.force_reply);
        }
        Resolution::Stop(_) => panic!("owner must pass in direct chats"),
    }

    let group = inbound_text("mock", "bot-1", "group", "subject-o", "hi");
    match f.resolver.resolve(&f.config, &group).await.unwrap() {
        Resolution::Pass(resolved) => {
            // Owner in a group still needs a mention or command to trigger.
            assert!(!resolved.force_reply);
        }
        Resolution::Stop(_) => panic!("owner must pass in groups"),
    }
}

#[tokio::test]
async fn personal_bot_stops_non_owner_silently() {
    let f = fixture();
    f.store
        .put_bot_profile(BotProfile::personal("bot-1", "owner-1"));

    for kind in ["p2p", "group"] {
        let msg = inbound_text("mock", "bot-1", kind, "stranger", "hi");
        match f.resolver.resolve(&f.config, &msg).await.unwrap() {
            Resolution::Stop(decision) => {
                assert!(decision.reply.is_none(), "personal-bot denial is silent")
            }
            Resolution::Pass(_) => panic!("stranger must not pass a personal bot"),
        }
    }
}

#[tokio::test]
async fn owner_lookup_falls_back_through_attributes() {
    let f = fixture();
    f.store
        .put_bot_profile(BotProfile::personal("bot-1", "owner-1"));
    // The linked identity exists under the open_id, not the subject id.
    let linked = f
        .store
        .upsert_channel_identity(
            &ChannelType::new("mock"),
            "ou-55",
            "Owner",
            &serde_json::Map::new(),
        )
        .await
        .unwrap();
    f.store
        .link_identity_to_user(&linked.id, "owner-1")
        .await
        .unwrap();

    let mut msg = inbound_text("mock", "bot-1", "p2p", "raw-subject", "hi");
    msg.sender.attributes.insert("open_id".into(), json!("ou-55"));
    match f.resolver.resolve(&f.config, &msg).await.unwrap() {
        Resolution::Pass(resolved) => assert_eq!(resolved.user_id, "owner-1"),
        Resolution::Stop(_) => panic!("open_id fallback should find the owner"),
    }
}

#[tokio::test]
async fn directory_enriches_profile() {
    let f = fixture_with(
        MockAdapter::new("mock")
            .with_sender()
            .with_directory()
            .with_directory_entry(
                "u-9",
                DirectoryEntry {
                    display_name: Some("Ada Lovelace".into()),
                    avatar_url: Some("https://example.com/a.png".into()),
                },
            ),
    );
    open_profile(&f.store, "bot-1");

    let msg = inbound_text("mock", "bot-1", "p2p", "u-9", "hello");
    match f.resolver.resolve(&f.config, &msg).await.unwrap() {
        Resolution::Pass(identity) => {
            assert_eq!(identity.display_name, "Ada Lovelace");
            assert_eq!(identity.avatar_url.as_deref(), Some("https://example.com/a.png"));
        }
        Resolution::Stop(_) => panic!("should pass"),
    }
    let stored = f
        .store
        .find_identity(&ChannelType::new("mock"), "u-9")
        .await
        .unwrap()
        .expect("stored");
    assert_eq!(stored.metadata["avatar_url"], "https://example.com/a.png");
}

#[tokio::test]
async fn directory_failure_never_substitutes_subject() {
    // Directory has no entry for the subject, so every lookup fails.
    let adapter = MockAdapter::new("mock").with_sender().with_directory();
    let f = fixture_with(adapter);
    open_profile(&f.store, "bot-1");

    let msg = inbound_text("mock", "bot-1", "p2p", "unknown-subject", "hello");
    match f.resolver.resolve(&f.config, &msg).await.unwrap() {
        Resolution::Pass(identity) => {
            // Same subject, no substitution; display name is what arrived.
            let stored = f
                .store
                .find_identity(&ChannelType::new("mock"), "unknown-subject")
                .await
                .unwrap()
                .expect("stored under the original subject");
            assert_eq!(stored.id, identity.channel_identity_id);
        }
        Resolution::Stop(_) => panic!("directory failure must not stop resolution"),
    }
}
