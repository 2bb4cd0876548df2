use database_operator::crd::Database;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Database::crd())?);
    Ok(())
}
