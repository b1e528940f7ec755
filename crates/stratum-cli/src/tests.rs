use super::*;

#[test]
fn test_cli_parse_run() {
    let args = Cli::from_args(&["stratum"], &["run", "-m", "services.json"]).unwrap();
    match args.command {
        Commands::Run(RunArgs {
            manifest,
            config,
            strategy,
            region,
        }) => {
            assert_eq!(manifest, "services.json");
            assert!(config.is_none());
            assert!(strategy.is_none());
            assert!(region.is_none());
        }
        _ => panic!("Expected Run command"),
    }
}

#[test]
fn test_cli_parse_run_overrides() {
    let args = Cli::from_args(
        &["stratum"],
        &[
            "run",
            "--manifest",
            "services.json",
            "-c",
            "orchestrator.json",
            "--strategy",
            "least-connections",
            "--region",
            "eu-west",
        ],
    )
    .unwrap();
    match args.command {
        Commands::Run(args) => {
            assert_eq!(args.config.as_deref(), Some("orchestrator.json"));
            assert_eq!(args.strategy.as_deref(), Some("least-connections"));
            assert_eq!(args.region.as_deref(), Some("eu-west"));
        }
        _ => panic!("Expected Run command"),
    }
}

#[test]
fn test_cli_parse_validate() {
    let args = Cli::from_args(&["stratum"], &["validate", "-m", "services.json"]).unwrap();
    assert!(matches!(
        args.command,
        Commands::Validate(ValidateArgs { manifest }) if manifest == "services.json"
    ));
}

#[test]
fn test_cli_run_requires_manifest() {
    assert!(Cli::from_args(&["stratum"], &["run"]).is_err());
    assert!(Cli::from_args(&["stratum"], &["serve"]).is_err());
}

#[test]
fn test_resolve_config_applies_overrides() {
    let args = RunArgs {
        manifest: "services.json".to_string(),
        config: None,
        strategy: Some("weighted".to_string()),
        region: Some("ap-south".to_string()),
    };
    let config = resolve_config(&args).unwrap();
    assert_eq!(config.strategy, LoadBalancingStrategy::Weighted);
    assert_eq!(config.region, "ap-south");

    let args = RunArgs {
        strategy: Some("fastest".to_string()),
        region: None,
        ..args
    };
    let config = resolve_config(&args).unwrap();
    assert_eq!(config.strategy, LoadBalancingStrategy::RoundRobin);
    assert_eq!(config.region, "default");
}
