use anyhow::{bail, Context};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(year) = std::env::args().nth(1) else {
        bail!("usage: address-growth <year>");
    };
    let year: i32 = year
        .trim()
        .parse()
        .with_context(|| format!("invalid year '{year}'"))?;

    let report = address_growth_lib::run(year).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
