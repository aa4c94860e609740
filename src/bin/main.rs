use chrono::NaiveDate;
use deal_valuation_engine::{
    embedding::{DegradePolicy, HashingEmbeddingProvider},
    matching::DisclosureEvent,
    normalizer::{ManualEntry, RawFinancialRecord},
    orchestrator::{FinancialInput, PeerSet, StaticPeerData},
    Collaborators, Comparable, DisclosureStage, EngineConfig, EntityProfile, EntityType, Geography, Intent, Money,
    Orchestrator, Party, PoolSelector, PrecedentTransaction, ReportingPeriod, ValuationRequest,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn comparables() -> Vec<Comparable> {
    [("VNDR-A", 8.0), ("VNDR-B", 9.0), ("VNDR-C", 10.0)]
        .into_iter()
        .map(|(id, multiple)| Comparable {
            entity_id: id.to_string(),
            industry_code: "SOFTWARE".to_string(),
            revenue: Money::from_major(12_000_000.0),
            ev_to_ebitda: multiple,
        })
        .collect()
}

fn precedents() -> Vec<PrecedentTransaction> {
    [("TX-2023-014", 9.5, 2023), ("TX-2024-221", 11.0, 2024)]
        .into_iter()
        .filter_map(|(id, multiple, year)| {
            Some(PrecedentTransaction {
                transaction_id: id.to_string(),
                industry_code: "SOFTWARE".to_string(),
                target_revenue: Money::from_major(8_000_000.0),
                ev_to_ebitda: multiple,
                closed_on: NaiveDate::from_ymd_opt(year, 6, 30)?,
            })
        })
        .collect()
}

fn profile(entity_type: EntityType, intents: Vec<Intent>, description: &str) -> EntityProfile {
    EntityProfile {
        entity_id: Uuid::new_v4(),
        entity_type,
        industry_code: Some("SOFTWARE".to_string()),
        revenue: Some(Money::from_major(10_000_000.0)),
        geography: Geography {
            country: Some("US".to_string()),
            region: Some("North America".to_string()),
        },
        intents,
        tags: vec!["saas".to_string(), "b2b".to_string()],
        description: Some(description.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .init();

    info!("Valuation demo starting");

    let mut collaborators = Collaborators::in_memory(Arc::new(HashingEmbeddingProvider::new(64)));
    collaborators.peers = Arc::new(
        StaticPeerData::new()
            .with_comparables("saas-mid-market", comparables())
            .with_precedents("saas-mid-market", precedents()),
    );
    let orchestrator = Orchestrator::new(EngineConfig::default(), collaborators);
    let tenant = Uuid::new_v4();

    // Valuation: $10M revenue, $2M EBITDA, 5% growth, 10% WACC
    let deal = profile(
        EntityType::Deal,
        vec![Intent::Divest],
        "Vertical SaaS for dental clinic scheduling and billing",
    );
    let period = ReportingPeriod {
        start: NaiveDate::from_ymd_opt(2025, 1, 1).ok_or("invalid date")?,
        end: NaiveDate::from_ymd_opt(2025, 12, 31).ok_or("invalid date")?,
    };
    let request = ValuationRequest {
        input: FinancialInput::Raw(RawFinancialRecord::ManualEntry(ManualEntry {
            entity_id: deal.entity_id,
            period: Some(period),
            currency: Some("USD".to_string()),
            revenue: Some(10_000_000.0),
            ebitda: Some(2_000_000.0),
            net_income: Some(1_200_000.0),
            debt: Some(3_000_000.0),
            cash: Some(750_000.0),
            growth_rate: Some(0.05),
            industry_code: Some("SOFTWARE".to_string()),
            ..ManualEntry::default()
        })),
        comparables: PeerSet::Named("saas-mid-market".to_string()),
        precedents: PeerSet::Named("saas-mid-market".to_string()),
        wacc_override: Some(0.10),
    };

    let outcome = orchestrator.run_valuation(tenant, request).await?;
    let valuation = &outcome.report.valuation;

    println!("\n=== VALUATION REPORT ===");
    println!("Entity: {}", valuation.entity_id);
    for estimate in &valuation.estimates {
        println!(
            "  {:<24} low {:>14}  mid {:>14}  high {:>14}  weight {:.2}",
            estimate.method.as_str(),
            estimate.range.low,
            estimate.range.mid,
            estimate.range.high,
            estimate.weight
        );
    }
    for exclusion in &valuation.exclusions {
        println!("  excluded {}: {}", exclusion.subject, exclusion.reason);
    }
    println!(
        "Enterprise value: {} ({} - {})",
        valuation.aggregated.mid, valuation.aggregated.low, valuation.aggregated.high
    );
    println!("Equity value: {} (net debt {})", valuation.equity_mid, valuation.net_debt);
    println!("Confidence: {:.2}", valuation.confidence);
    println!("Risk score: {:.2}", outcome.report.risk.risk_score);
    for flag in &outcome.report.risk.flags {
        println!("  [{:?}] {}: {}", flag.severity, flag.rule, flag.rationale);
    }

    // Matching: the deal against two ecosystem members
    let buyer = profile(
        EntityType::Member,
        vec![Intent::Acquire],
        "Strategic acquirer of healthcare practice management software",
    );
    let partner = profile(
        EntityType::Member,
        vec![Intent::Partner],
        "Payments processor for clinics",
    );
    for entity in [&deal, &buyer, &partner] {
        orchestrator
            .generate_embedding(tenant, entity.entity_id, Some(entity.clone()), DegradePolicy::StructuredOnly)
            .await?;
    }

    let selector = PoolSelector {
        entity_type: Some(EntityType::Member),
        entity_ids: vec![],
    };
    let matches = orchestrator.run_match(tenant, deal.entity_id, selector, Some(10)).await?;

    println!("\n=== MATCH REPORT ===");
    for candidate in &matches {
        println!(
            "  {} similarity {:.3} compatibility {:.3} stage {:?}",
            candidate.candidate_id,
            candidate.similarity,
            candidate.compatibility,
            candidate.stage()
        );
    }

    if let Some(top) = matches.iter().find(|m| m.stage() == DisclosureStage::Teaser) {
        for party in [Party::Initiator, Party::Counterparty] {
            orchestrator
                .apply_disclosure(tenant, top.match_id, DisclosureEvent::InterestExpressed { party })
                .await?;
        }
        let progressed = orchestrator
            .apply_disclosure(
                tenant,
                top.match_id,
                DisclosureEvent::NdaAccepted {
                    party: Party::Initiator,
                },
            )
            .await?;
        println!("\nTop match {} is now {:?}", progressed.match_id, progressed.stage());
        for transition in &progressed.disclosure.history {
            println!("  {:?} -> {:?} at {}", transition.from, transition.to, transition.at);
        }
    }

    Ok(())
}
