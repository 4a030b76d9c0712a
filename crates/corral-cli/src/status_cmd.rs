//! The `corral status` command: a quick operator snapshot of one scope.

use anyhow::Result;
use sqlx::PgPool;

use corral_db::queries::orchestrators as orchestrator_db;
use corral_db::queries::tasks as task_db;

/// Print queue counts for a scope and the registered fleet.
pub async fn run_status(pool: &PgPool, scope: &str) -> Result<()> {
    let counts = task_db::queue_counts(pool, scope).await?;

    println!("Scope: {scope}");
    println!("  incoming:    {}", counts.incoming);
    println!("  claimed:     {}", counts.claimed);
    println!("  provisional: {}", counts.provisional);

    let orchestrators = orchestrator_db::list_orchestrators(pool).await?;
    if orchestrators.is_empty() {
        println!("No orchestrators registered.");
    } else {
        println!("Orchestrators:");
        for o in &orchestrators {
            println!(
                "  {} [{}] scope={} last_heartbeat={}",
                o.id, o.status, o.scope, o.last_heartbeat
            );
        }
    }

    Ok(())
}
