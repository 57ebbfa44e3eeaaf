mod common;

use std::{sync::Arc, time::Duration};

use chathandoff_client::{
    BackendError, Handoff, HandoffConfig, HandoffStep, LaunchDispatcher, LinkCheck, PollPhase,
    PollerSettings, VerificationFlow,
};
use chathandoff_core::{
    AppVariant, CodeStore, FailureKind, InitRequest, KeyValueStore, LaunchPayload, OpenVerdict,
    Platform, PreferenceStore, Visibility,
};
use common::{CODE, DISPATCH_URL, FakeBackend, Harness, SERVICE_PHONE, test_config};
use tokio::time::{sleep, timeout};

const UNIVERSAL_URI: &str = "https://wa.me/15550100000?text=VERIFY%20123456";

fn dispatcher(harness: &Harness, platform: Platform) -> LaunchDispatcher {
    let config = test_config();
    LaunchDispatcher::new(
        config.link_schemes,
        platform,
        config.verifier,
        PreferenceStore::new(harness.store()),
        harness.navigator.clone(),
        harness.visibility.clone(),
        harness.clock.clone(),
    )
}

fn share(text: &str) -> LaunchPayload {
    LaunchPayload::ShareText {
        text: text.to_owned(),
    }
}

#[tokio::test(start_paused = true)]
async fn first_time_user_goes_through_the_universal_link_and_gets_authenticated() {
    let harness = Harness::new(FakeBackend::new().pending_times(2).verified("tok-1"));
    let mut handoff = Handoff::start(&test_config(), harness.deps(Platform::Other), None, None)
        .await
        .expect("handoff starts");

    assert_eq!(handoff.code(), CODE);
    assert_eq!(harness.navigator.uris(), vec![UNIVERSAL_URI.to_owned()]);
    let attempt = handoff.last_attempt().expect("launched");
    assert_eq!(attempt.variant, None);

    sleep(Duration::from_millis(300)).await;
    harness.visibility.set(Visibility::Hidden);

    assert_eq!(handoff.next_step().await, HandoffStep::Authenticated);
    assert_eq!(harness.backend.status_calls(), 3);
    assert_eq!(harness.sink.tokens(), vec!["tok-1".to_owned()]);

    sleep(Duration::from_secs(20)).await;
    assert_eq!(harness.backend.status_calls(), 3, "no polling after hand-off");

    let codes = CodeStore::new(harness.store());
    assert_eq!(codes.code(), None);
    assert_eq!(PreferenceStore::new(harness.store()).get(), None);
}

#[tokio::test(start_paused = true)]
async fn remembered_business_variant_on_android_opens_by_package() {
    let harness = Harness::new(FakeBackend::new());
    PreferenceStore::new(harness.store())
        .set(AppVariant::Business)
        .unwrap();
    let dispatcher = dispatcher(&harness, Platform::AndroidLike);

    let payload = LaunchPayload::ChatWithNumber {
        phone: SERVICE_PHONE.to_owned(),
        text: "VERIFY 123456".to_owned(),
    };
    let mut launch = dispatcher.dispatch(payload, None);
    assert_eq!(launch.attempt.variant, Some(AppVariant::Business));
    assert!(launch.attempt.uri.starts_with("intent://send?"));
    assert!(
        launch
            .attempt
            .uri
            .contains("scheme=whatsapp-smb;package=com.whatsapp.w4b"),
        "{}",
        launch.attempt.uri
    );
    assert_eq!(harness.navigator.uris(), vec![launch.attempt.uri.clone()]);

    sleep(Duration::from_millis(100)).await;
    harness.visibility.set(Visibility::Hidden);
    assert_eq!(launch.watch.verdict().await, Some(OpenVerdict::Succeeded));

    sleep(Duration::from_secs(10)).await;
    assert_eq!(
        PreferenceStore::new(harness.store()).get(),
        Some(AppVariant::Business)
    );
}

#[tokio::test(start_paused = true)]
async fn app_that_never_opens_forgets_the_variant() {
    let harness = Harness::new(FakeBackend::new());
    let prefs = PreferenceStore::new(harness.store());
    prefs.set(AppVariant::Business).unwrap();
    let dispatcher = dispatcher(&harness, Platform::IosLike);

    let mut launch = dispatcher.dispatch(share("hello there"), None);
    assert_eq!(launch.attempt.uri, "whatsapp-smb://send?text=hello%20there");
    assert_eq!(
        launch.watch.verdict().await,
        Some(OpenVerdict::Failed(FailureKind::NeverHidden))
    );
    assert_eq!(prefs.get(), None);

    let next = dispatcher.dispatch(share("hello there"), None);
    assert_eq!(next.attempt.variant, None);
    assert_eq!(next.attempt.uri, "whatsapp://send?text=hello%20there");
}

#[tokio::test(start_paused = true)]
async fn quick_bounce_back_counts_as_not_opened() {
    let harness = Harness::new(FakeBackend::new());
    let dispatcher = dispatcher(&harness, Platform::AndroidLike);

    let mut launch = dispatcher.dispatch(share("hi"), Some(AppVariant::Personal));
    assert_eq!(
        PreferenceStore::new(harness.store()).get(),
        Some(AppVariant::Personal),
        "an explicit pick is remembered before launching"
    );

    sleep(Duration::from_millis(500)).await;
    harness.visibility.set(Visibility::Hidden);
    sleep(Duration::from_millis(400)).await;
    harness.visibility.set(Visibility::Visible);

    let verdict = launch.watch.verdict().await;
    let Some(OpenVerdict::Failed(FailureKind::Bounced { hidden_for_ms })) = verdict else {
        panic!("expected a bounce, got {verdict:?}");
    };
    assert!(hidden_for_ms < 1_500, "{hidden_for_ms}");
    assert_eq!(PreferenceStore::new(harness.store()).get(), None);
}

#[tokio::test(start_paused = true)]
async fn bounce_and_rehide_in_one_instant_still_counts_as_a_bounce() {
    let harness = Harness::new(FakeBackend::new());
    let prefs = PreferenceStore::new(harness.store());
    prefs.set(AppVariant::Business).unwrap();
    let dispatcher = dispatcher(&harness, Platform::AndroidLike);

    let payload = LaunchPayload::ChatWithNumber {
        phone: SERVICE_PHONE.to_owned(),
        text: "VERIFY 123456".to_owned(),
    };
    let mut launch = dispatcher.dispatch(payload, None);

    sleep(Duration::from_millis(100)).await;
    harness.visibility.set(Visibility::Hidden);
    sleep(Duration::from_millis(200)).await;
    // The OS snaps back and a second window covers the page before anyone looks.
    harness.visibility.set(Visibility::Visible);
    harness.visibility.set(Visibility::Hidden);

    let verdict = launch.watch.verdict().await;
    let Some(OpenVerdict::Failed(FailureKind::Bounced { hidden_for_ms })) = verdict else {
        panic!("expected a bounce, got {verdict:?}");
    };
    assert!((190..=210).contains(&hidden_for_ms), "{hidden_for_ms}");
    assert_eq!(prefs.get(), None);
}

#[tokio::test(start_paused = true)]
async fn stale_failed_open_leaves_a_newer_pick_alone() {
    let harness = Harness::new(FakeBackend::new());
    let prefs = PreferenceStore::new(harness.store());
    prefs.set(AppVariant::Business).unwrap();
    let dispatcher = dispatcher(&harness, Platform::AndroidLike);

    let mut first = dispatcher.dispatch(share("hi"), None);
    assert_eq!(first.attempt.variant, Some(AppVariant::Business));

    sleep(Duration::from_millis(3_900)).await;
    let mut second = dispatcher.dispatch(share("hi"), Some(AppVariant::Personal));
    assert_eq!(prefs.get(), Some(AppVariant::Personal));

    assert_eq!(
        first.watch.verdict().await,
        Some(OpenVerdict::Failed(FailureKind::NeverHidden))
    );
    assert_eq!(prefs.get(), Some(AppVariant::Personal));

    harness.visibility.set(Visibility::Hidden);
    assert_eq!(second.watch.verdict().await, Some(OpenVerdict::Succeeded));
    assert_eq!(prefs.get(), Some(AppVariant::Personal));
}

#[tokio::test(start_paused = true)]
async fn verification_during_grace_beats_a_failed_open() {
    let harness = Harness::new(FakeBackend::new().pending_times(2).verified("tok-1"));
    let config = HandoffConfig {
        grace_ms: 3_000,
        ..test_config()
    };
    let mut handoff = Handoff::start(&config, harness.deps(Platform::Other), None, None)
        .await
        .expect("handoff starts");

    // Never hidden: the open fails at 4s, the poll at 6s still lands inside the grace window.
    assert_eq!(handoff.next_step().await, HandoffStep::Authenticated);
    assert_eq!(harness.sink.tokens(), vec!["tok-1".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn failed_open_returns_to_picker_while_polling_continues() {
    let harness = Harness::new(FakeBackend::new().pending_times(3).verified("tok-1"));
    let prefs = PreferenceStore::new(harness.store());
    prefs.set(AppVariant::Business).unwrap();

    let mut handoff = Handoff::start(
        &test_config(),
        harness.deps(Platform::AndroidLike),
        None,
        None,
    )
    .await
    .expect("handoff starts");
    let first_uri = handoff.last_attempt().expect("launched").uri.clone();
    assert!(first_uri.contains("package=com.whatsapp.w4b"), "{first_uri}");
    assert!(harness.backend.init_requests()[0].is_business);

    assert_eq!(handoff.next_step().await, HandoffStep::ReturnToPicker);
    assert_eq!(prefs.get(), None, "failed variant is forgotten");
    assert_eq!(handoff.poll_status().phase, PollPhase::Polling);

    let uri = handoff.relaunch(Some(AppVariant::Personal)).uri.clone();
    assert_eq!(
        uri,
        "whatsapp://send?phone=15550100000&text=VERIFY%20123456"
    );
    assert_eq!(prefs.get(), Some(AppVariant::Personal));
    harness.visibility.set(Visibility::Hidden);

    assert_eq!(handoff.next_step().await, HandoffStep::Authenticated);
    assert_eq!(harness.backend.status_calls(), 4);
    assert_eq!(harness.backend.init_requests().len(), 1, "same code reused");
    assert_eq!(harness.navigator.uris(), vec![first_uri, uri]);
    assert_eq!(prefs.get(), Some(AppVariant::Personal));
}

#[tokio::test(start_paused = true)]
async fn relaunch_after_giving_up_resumes_polling_for_the_same_code() {
    let harness = Harness::new(FakeBackend::new().pending_times(2).verified("tok-1"));
    let config = HandoffConfig {
        poller: PollerSettings {
            give_up_after_ms: Some(5_000),
            ..PollerSettings::default()
        },
        ..test_config()
    };
    let mut handoff = Handoff::start(&config, harness.deps(Platform::Other), None, None)
        .await
        .expect("handoff starts");

    sleep(Duration::from_millis(100)).await;
    harness.visibility.set(Visibility::Hidden);

    assert_eq!(handoff.next_step().await, HandoffStep::ReturnToPicker);
    assert_eq!(handoff.poll_status().phase, PollPhase::GaveUp);
    assert_eq!(harness.backend.status_calls(), 2);
    assert!(
        timeout(Duration::from_secs(60), handoff.next_step())
            .await
            .is_err(),
        "a reported give-up waits for a relaunch"
    );

    harness.visibility.set(Visibility::Visible);
    let uri = handoff.relaunch(None).uri.clone();
    assert_eq!(uri, UNIVERSAL_URI);
    assert_eq!(handoff.poll_status().phase, PollPhase::Polling);

    assert_eq!(handoff.next_step().await, HandoffStep::Authenticated);
    assert_eq!(harness.sink.tokens(), vec!["tok-1".to_owned()]);
    assert_eq!(harness.backend.status_calls(), 3);
    assert_eq!(harness.backend.init_requests().len(), 1, "same code reused");
    assert_eq!(handoff.code(), CODE);
}

#[tokio::test(start_paused = true)]
async fn expired_code_restarts_the_flow() {
    let harness = Harness::new(FakeBackend::new().then(Err(BackendError::CodeNotFound {
        code: CODE.to_owned(),
    })));
    let mut handoff = Handoff::start(&test_config(), harness.deps(Platform::Other), None, None)
        .await
        .expect("handoff starts");
    harness.visibility.set(Visibility::Hidden);

    assert_eq!(handoff.next_step().await, HandoffStep::RestartFlow);
    assert_eq!(CodeStore::new(harness.store()).code(), None);
    assert!(harness.sink.tokens().is_empty());
}

#[tokio::test(start_paused = true)]
async fn refresh_resumes_the_stored_code_without_reopening_the_app() {
    let harness = Harness::new(FakeBackend::new().pending_times(1).verified("tok-1"));

    let first = Handoff::start(&test_config(), harness.deps(Platform::Other), None, None)
        .await
        .expect("handoff starts");
    assert_eq!(harness.navigator.uris().len(), 1);
    drop(first);

    let mut resumed = Handoff::start(&test_config(), harness.deps(Platform::Other), None, None)
        .await
        .expect("handoff resumes");
    assert_eq!(resumed.code(), CODE);
    assert!(resumed.last_attempt().is_none());
    assert_eq!(harness.navigator.uris().len(), 1, "pending launch is used once");
    assert_eq!(harness.backend.init_requests().len(), 1);

    assert_eq!(resumed.next_step().await, HandoffStep::Authenticated);
    assert_eq!(harness.sink.tokens(), vec!["tok-1".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn resumed_flow_can_still_relaunch_with_the_code_message() {
    let harness = Harness::new(FakeBackend::new());
    CodeStore::new(harness.store()).set_code("654321").unwrap();

    let mut handoff = Handoff::start(&test_config(), harness.deps(Platform::Other), None, None)
        .await
        .expect("handoff resumes");
    assert!(harness.navigator.uris().is_empty());

    let uri = handoff.relaunch(None).uri.clone();
    assert_eq!(uri, "https://wa.me/15550100000?text=VERIFY%20654321");
}

#[tokio::test]
async fn referral_code_is_only_sent_for_first_time_users() {
    let harness = Harness::new(FakeBackend::new());
    let flow = VerificationFlow::new(harness.backend.clone(), harness.store());

    let start = flow
        .begin(Some(" ref-42 "), None)
        .await
        .expect("code issued");
    assert!(!start.resumed);
    assert_eq!(
        start.launch,
        Some(LaunchPayload::ChatWithNumber {
            phone: SERVICE_PHONE.to_owned(),
            text: "VERIFY 123456".to_owned(),
        })
    );
    assert_eq!(
        harness.backend.init_requests(),
        vec![InitRequest {
            referral_code: Some("ref-42".to_owned()),
            is_business: false,
        }]
    );

    let returning = Harness::new(FakeBackend::new());
    PreferenceStore::new(returning.store())
        .set(AppVariant::Business)
        .unwrap();
    let flow = VerificationFlow::new(returning.backend.clone(), returning.store());
    flow.begin(Some("ref-42"), None).await.expect("code issued");
    assert_eq!(
        returning.backend.init_requests(),
        vec![InitRequest {
            referral_code: None,
            is_business: true,
        }]
    );
}

#[tokio::test]
async fn begin_reuses_code_and_hands_out_the_pending_link_once() {
    let harness = Harness::new(FakeBackend::new());
    let store: Arc<dyn KeyValueStore> = harness.store();
    let codes = CodeStore::new(store.clone());
    codes.set_code("777777").unwrap();
    codes.set_pending_dispatch(DISPATCH_URL).unwrap();

    let flow = VerificationFlow::new(harness.backend.clone(), store);
    let first = flow.begin(None, None).await.expect("resumed");
    assert!(first.resumed);
    assert_eq!(first.code, "777777");
    assert!(first.launch.is_some());

    let second = flow.begin(None, None).await.expect("resumed");
    assert_eq!(second.launch, None);
    assert!(harness.backend.init_requests().is_empty());
}

#[tokio::test]
async fn verify_link_code_is_checked_once() {
    let harness = Harness::new(FakeBackend::new().verified("tok-9"));
    let flow = VerificationFlow::new(harness.backend.clone(), harness.store());
    CodeStore::new(harness.store()).set_code(CODE).unwrap();

    assert_eq!(
        flow.check_link_code(CODE, harness.sink.as_ref()).await,
        LinkCheck::Verified
    );
    assert_eq!(harness.sink.tokens(), vec!["tok-9".to_owned()]);
    assert_eq!(CodeStore::new(harness.store()).code(), None);

    assert_eq!(
        flow.check_link_code(CODE, harness.sink.as_ref()).await,
        LinkCheck::Restart,
        "a pending answer sends the user back to the start"
    );
    assert_eq!(harness.backend.status_calls(), 2);
}
