//! Unit tests for data models module
//!
//! Covers the config-file spelling of weekdays and the defaults applied to
//! optional condition fields.

use super::*;

#[test]
fn test_weekday_uses_short_lowercase_names() {
    let days: Vec<Weekday> = serde_json::from_str(r#"["mon", "sat", "sun"]"#).unwrap();
    assert_eq!(days, vec![Weekday::Mon, Weekday::Sat, Weekday::Sun]);

    let encoded = serde_json::to_string(&Weekday::Wed).unwrap();
    assert_eq!(encoded, "\"wed\"");
}

#[test]
fn test_weekday_from_chrono() {
    assert_eq!(Weekday::from(chrono::Weekday::Mon), Weekday::Mon);
    assert_eq!(Weekday::from(chrono::Weekday::Sun), Weekday::Sun);
    assert_eq!(Weekday::ALL.len(), 7);
}

#[test]
fn test_condition_defaults() {
    let spec: ConditionSpec = toml::from_str(
        r#"
script = "/opt/goals/study.sh"
require_on = ["mon", "tue"]
"#,
    )
    .unwrap();

    assert!(spec.args.is_empty());
    assert!(!spec.validated, "new conditions start unvalidated");
    assert!(spec.internal_script.is_none());
    assert!(spec.pause.is_none());
    assert!(spec.is_required_on(Weekday::Tue));
    assert!(!spec.is_required_on(Weekday::Sun));
}

#[test]
fn test_executable_path_prefers_internal_copy() {
    let mut spec = ConditionSpec::new("/home/me/study.sh", vec![Weekday::Mon]);
    assert_eq!(spec.executable_path(), &PathBuf::from("/home/me/study.sh"));

    spec.internal_script = Some(PathBuf::from("/var/db/digital-carrot/scripts/study"));
    assert_eq!(
        spec.executable_path(),
        &PathBuf::from("/var/db/digital-carrot/scripts/study")
    );
}

#[test]
fn test_pause_limits_default_to_three_days() {
    let pause = PauseCondition {
        script: PathBuf::from("/opt/pause.sh"),
        args: vec![],
        max_pause_days: None,
        internal_script: None,
    };
    assert_eq!(pause.max_days(), 3);
    assert_eq!(ConditionPause::default().max_days(), 3);

    let capped = ConditionPause {
        max_pause_days: Some(7),
        pause_args: vec!["--week".to_string()],
    };
    assert_eq!(capped.max_days(), 7);
}

#[test]
fn test_disable_method_spelling() {
    let method: DisableMethod = serde_json::from_str("\"password\"").unwrap();
    assert_eq!(method, DisableMethod::Password);
    assert!(serde_json::from_str::<DisableMethod>("\"yubikey\"").is_err());
}
