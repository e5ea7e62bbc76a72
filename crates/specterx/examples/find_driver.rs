//! Looks up a loaded kernel module by file name and prints its descriptor.
//!
//! Usage: `find_driver [name]`, defaulting to `ntoskrnl.exe`.

#[cfg(windows)]
fn main() -> specterx::Result<()> {
    use specterx::{enumerate, fileio};

    env_logger::init();

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ntoskrnl.exe".to_string());

    let module = enumerate::find_system_module(&name)?;
    let dos_path = fileio::dos_path(&module.full_path)?;

    println!("module : {}", module.file_name);
    println!("base   : {:#018x}", module.image_base);
    println!("size   : {:#x}", module.image_size);
    println!("path   : {dos_path}");

    Ok(())
}

#[cfg(not(windows))]
fn main() {
    eprintln!("this example only runs on Windows");
}
