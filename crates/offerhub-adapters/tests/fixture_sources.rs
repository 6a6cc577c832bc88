use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use offerhub_adapters::{build_adapters, FetchContext, SourceRegistry};
use offerhub_core::{RawPayload, SourceKind};
use offerhub_storage::HttpFetcher;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

#[tokio::test]
async fn checked_in_registry_fetches_every_enabled_fixture_source() {
    let root = workspace_root();
    let registry = SourceRegistry::load(&root.join("sources.yaml"))
        .await
        .expect("load sources.yaml");
    let http = Arc::new(HttpFetcher::new(Default::default()).expect("http"));
    let adapters = build_adapters(&registry, &root, http).expect("build adapters");

    let names: Vec<_> = adapters.iter().map(|a| a.source_name().to_string()).collect();
    assert_eq!(
        names,
        vec!["forms", "hdfc-lounges", "icici-lounges", "redemptions", "travel-tips", "bank-verified"]
    );

    let ctx = FetchContext::new(Duration::from_secs(5));
    let mut counts = Vec::new();
    for adapter in &adapters {
        let records = adapter.fetch(&ctx).await.expect("fixture fetch");
        assert!(records.iter().all(|r| r.source_name == adapter.source_name()));
        assert!(records.iter().all(|r| r.trust == adapter.trust_level()));
        counts.push((adapter.source_name().to_string(), records.len()));
    }
    assert_eq!(
        counts,
        vec![
            ("forms".to_string(), 4),
            ("hdfc-lounges".to_string(), 3),
            ("icici-lounges".to_string(), 2),
            ("redemptions".to_string(), 4),
            ("travel-tips".to_string(), 3),
            ("bank-verified".to_string(), 3),
        ]
    );
}

#[tokio::test]
async fn scraped_lounges_are_benefits_from_the_configured_bank() {
    let root = workspace_root();
    let registry = SourceRegistry::load(&root.join("sources.yaml")).await.unwrap();
    let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
    let adapters = build_adapters(&registry, &root, http).unwrap();
    let hdfc = adapters
        .iter()
        .find(|a| a.source_name() == "hdfc-lounges")
        .expect("hdfc adapter");

    let records = hdfc.fetch(&FetchContext::new(Duration::from_secs(5))).await.unwrap();
    assert_eq!(hdfc.source_kind(), SourceKind::Scraped);
    let ids: Vec<_> = records.iter().filter_map(|r| r.source_id.clone()).collect();
    assert_eq!(ids, vec!["lounge-regalia-gold", "lounge-infinia", "lounge-millennia"]);
    for record in &records {
        match &record.payload {
            RawPayload::Benefit(benefit) => {
                assert_eq!(benefit.bank_name.as_deref(), Some("HDFC Bank"));
                assert_eq!(benefit.benefit_type.as_deref(), Some("lounge_access"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
