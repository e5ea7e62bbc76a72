//! Lists the loaded modules of a process.
//!
//! Usage: `list_modules [pid]`; without a pid the current process is walked.

#[cfg(windows)]
fn main() -> specterx::Result<()> {
    use specterx::utils::handle::current_process;
    use specterx::{loader, process, Walk};
    use winapi::um::winnt::{PROCESS_QUERY_INFORMATION, PROCESS_VM_READ};

    env_logger::init();

    let target = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse::<u32>().ok())
        .map(|pid| process::open_process(pid, PROCESS_QUERY_INFORMATION | PROCESS_VM_READ))
        .transpose()?;

    let handle = target
        .as_ref()
        .map(|owned| owned.as_raw())
        .unwrap_or_else(current_process);

    loader::enumerate_process_modules(handle, |module| {
        println!(
            "{:#018x}  {:>10}  {}",
            module.dll_base, module.size_of_image, module.full_name
        );
        Walk::Continue
    })?;

    Ok(())
}

#[cfg(not(windows))]
fn main() {
    eprintln!("this example only runs on Windows");
}
