use kube::CustomResourceExt;
use operator::crd::AKODeploymentConfig;

use clap::Parser;
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    // Output directory
    #[arg(short, long, default_value = ".")]
    output: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    // Create directory if it does not exist
    std::fs::create_dir_all(&args.output)?;
    std::fs::write(
        format!("{}/akodeploymentconfig.yaml", args.output),
        serde_yaml::to_string(&AKODeploymentConfig::crd())?,
    )?;
    Ok(())
}
