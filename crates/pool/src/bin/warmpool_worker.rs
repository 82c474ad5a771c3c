// Worker process launched by the pool manager, one per pool slot

fn main() -> anyhow::Result<()> {
    warmpool_worker::cli::main_entry()
}
