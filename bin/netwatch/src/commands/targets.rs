use netwatch_engine::list_page_targets;

pub async fn run(port: u16) -> anyhow::Result<()> {
    let targets = list_page_targets(port).await?;

    if targets.is_empty() {
        println!("No debuggable page targets on port {}.", port);
        return Ok(());
    }

    for target in targets {
        println!("{}  {}  {}", target.id, target.url, target.title);
    }
    Ok(())
}
