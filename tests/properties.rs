use proptest::prelude::*;

use ar_pipeline::field::FieldKind;
use ar_pipeline::tracker::TargetKind;
use ar_pipeline::{
    bootstrap, CapabilityRegistry, Configuration, FieldError, FieldScope, FieldValue,
    PipelineConfig, TargetSpec,
};

fn proptest_config() -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(64);
    ProptestConfig::with_cases(cases)
}

fn config() -> Configuration {
    Configuration::new()
        .declare("flag", FieldValue::Bool(false), FieldScope::Live)
        .declare("count", FieldValue::Int(0), FieldScope::Live)
        .declare("ratio", FieldValue::Float(0.0), FieldScope::Live)
        .declare("label", FieldValue::Text(String::new()), FieldScope::Live)
}

fn arb_kind() -> impl Strategy<Value = TargetKind> {
    prop_oneof![Just(TargetKind::Single), Just(TargetKind::Multi)]
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn typed_fields_read_back_what_was_set(
        flag in any::<bool>(),
        count in any::<i64>(),
        ratio in -1.0e12f64..1.0e12,
        label in ".*",
    ) {
        let mut cfg = config();
        cfg.set("flag", flag).unwrap();
        cfg.set("count", count).unwrap();
        cfg.set("ratio", ratio).unwrap();
        cfg.set("label", label.clone()).unwrap();
        prop_assert_eq!(cfg.get::<bool>("flag"), Some(flag));
        prop_assert_eq!(cfg.get::<i64>("count"), Some(count));
        prop_assert_eq!(cfg.get::<f64>("ratio"), Some(ratio));
        prop_assert_eq!(cfg.get::<String>("label"), Some(label));
    }

    #[test]
    fn wrong_type_or_name_is_absent(count in any::<i64>(), name in "[a-z]{1,12}") {
        let mut cfg = config();
        prop_assert_eq!(cfg.get::<bool>("count"), None);
        prop_assert_eq!(cfg.get::<String>("ratio"), None);
        prop_assert_eq!(
            cfg.set("flag", count),
            Err(FieldError::TypeMismatch {
                name: "flag".to_string(),
                expected: FieldKind::Bool,
                found: FieldKind::Int,
            })
        );
        prop_assert_eq!(cfg.get::<bool>("flag"), Some(false));
        let unknown = format!("x_{}", name);
        prop_assert_eq!(cfg.get::<i64>(&unknown), None);
        prop_assert_eq!(cfg.set(&unknown, count), Err(FieldError::Unknown(unknown.clone())));
    }

    #[test]
    fn target_specs_parse_their_fields(
        kind in arb_kind(),
        pattern in "[A-Za-z0-9_./-]{1,24}",
        size in 0.001f64..10_000.0,
        offsets in proptest::option::of((-1_000.0f64..1_000.0, -1_000.0f64..1_000.0)),
    ) {
        let spec = match offsets {
            Some((x, y)) => format!("{};{};{};{};{}", kind.as_str(), pattern, size, x, y),
            None => format!("{};{};{}", kind.as_str(), pattern, size),
        };
        let parsed = TargetSpec::parse(&spec).unwrap();
        prop_assert_eq!(parsed.kind, kind);
        prop_assert_eq!(&parsed.pattern, &pattern);
        prop_assert_eq!(parsed.size, size);
        prop_assert_eq!((parsed.offset_x, parsed.offset_y), offsets.unwrap_or((0.0, 0.0)));
        // Canonical form parses to the same spec.
        prop_assert_eq!(TargetSpec::parse(&parsed.canonical()).unwrap(), parsed);
    }

    #[test]
    fn non_positive_size_is_rejected(size in -10_000.0f64..=0.0) {
        let spec = format!("single;data/patt.hiro;{}", size);
        prop_assert!(TargetSpec::parse(&spec).is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn overlay_never_outlives_the_marker(script in proptest::collection::vec(any::<bool>(), 1..16)) {
        let text: String = script.iter().map(|v| if *v { '1' } else { '0' }).collect();
        let mut cfg = PipelineConfig::default();
        cfg.video.plugin = "replayvideo".to_string();
        cfg.video.config = text;
        cfg.tracker.config = "mode=1;".to_string();
        cfg.tracker.timeout_ms = 2_000;

        let mut registry = CapabilityRegistry::with_builtins();
        let mut session = bootstrap(&cfg, &mut registry).unwrap();
        let target = session.targets[0];
        for visible in &script {
            let report = session.pipeline.tick();
            prop_assert_eq!(report.visible.contains(&target), *visible);
        }
        session.shutdown();
    }
}
