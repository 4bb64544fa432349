use clap::{Arg, ArgMatches, Command};
use hydroarray::config::ArrayConfig;
use hydroarray::logging::{init_logging, parse_log_level, LogConfig, LogOutput};
use hydroarray::simulation::SimulationEngine;

fn main() {
    let matches = Command::new("hydroarray")
        .version(env!("CARGO_PKG_VERSION"))
        .about("ハイドロフォンアレイ協調・音源定位エンジン")
        .long_about("分散ハイドロフォンアレイの協調状態機械と TDOA 測位を\n\
                     模擬音響環境上で実行します。")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("アレイ設定ファイル(.yaml)のパスを指定")
        )
        .arg(
            Arg::new("info")
                .short('i')
                .long("info")
                .action(clap::ArgAction::SetTrue)
                .help("設定の概要のみ表示して終了")
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(f64))
                .help("実行時間[s]（省略時は simulation.t_max）")
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::Count)
                .help("詳細出力レベル (-v: DEBUG, -vv: TRACE)")
        )
        .arg(
            Arg::new("log-output")
                .long("log-output")
                .value_name("TARGET")
                .value_parser(["console", "file", "both"])
                .default_value("console")
                .help("ログ出力先")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("ログレベル (trace, debug, info, warn, error)。-v より優先")
        )
        .get_matches();

    let Some(config_path) = matches.get_one::<String>("config") else {
        show_default_help();
        return;
    };

    if let Err(e) = run(config_path, &matches) {
        eprintln!("エラー: {}", e);
        std::process::exit(1);
    }
}

fn run(config_path: &str, matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let config = ArrayConfig::from_file(config_path)?;
    let verbose_level = matches.get_count("verbose");

    if matches.get_flag("info") {
        config.print_summary();
        return Ok(());
    }

    let level = match matches.get_one::<String>("log-level") {
        Some(level) => parse_log_level(level),
        None => LogConfig::level_from_verbosity(verbose_level),
    };
    let output = matches
        .get_one::<String>("log-output")
        .map(|s| s.parse::<LogOutput>())
        .transpose()?
        .unwrap_or(LogOutput::Console);
    let _guard = init_logging(LogConfig { level, output, ..LogConfig::default() })?;

    println!("ハイドロフォンアレイ協調エンジン - hydroarray v{}", env!("CARGO_PKG_VERSION"));
    println!();
    config.print_summary();
    println!();

    let duration = matches.get_one::<f64>("duration").copied();
    let mut engine = SimulationEngine::new(config, verbose_level)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let summary = runtime.block_on(engine.run(duration))?;

    println!();
    println!("=== 結果 ===");
    println!("測位: {} 件（失敗 {} 件）", summary.fixes, summary.failed_fixes);
    println!("コンタクト: {} 件", summary.contacts);
    if let Some(error) = summary.mean_error {
        println!("平均測位誤差: {:.2} m", error);
    }

    Ok(())
}

/// 使用方法を表示
fn show_default_help() {
    println!("使用方法:");
    println!("  hydroarray [オプション]");
    println!();
    println!("オプション:");
    println!("  -c, --config <FILE>       アレイ設定ファイルを指定して実行");
    println!("  -i, --info                設定の概要のみ表示");
    println!("  -d, --duration <SECONDS>  実行時間を上書き");
    println!("  -v, --verbose             詳細出力 (複数指定で詳細レベル上昇)");
    println!("      --log-output <TARGET> ログ出力先 (console, file, both)");
    println!("      --log-level <LEVEL>   ログレベル");
    println!("  -h, --help                このヘルプを表示");
    println!();
    println!("例:");
    println!("  hydroarray -c configs/array_sim.yaml");
    println!("  hydroarray -c configs/array_sim.yaml -d 60 -v");
    println!("  hydroarray -c configs/array_sim.yaml -i");
}
