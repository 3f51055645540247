//! Interactive shell over a `fat32core`-backed disk image.
//!
//! This is the REPL `SPEC_FULL.md` §6.3 treats as an external collaborator:
//! it owns the prompt, the line reader and command dispatch, and drives the
//! `fat32core::fs::FileSystem` facade for everything else. Mirrors the shape
//! of the teacher crate's `example/fat32-fs-std` binary, trimmed to the verbs
//! this core actually implements.

use clap::{Arg, Command};
use fat32core::cache::sync_all;
use fat32core::device::{BlockDevice, StdBlockDevice};
use fat32core::fs::FileSystem;

use std::io::{self, Write};
use std::sync::Arc;

fn main() {
    env_logger::init();

    let matches = Command::new("fat32-shell")
        .about("🦀 Interactive shell over a FAT32 disk image")
        .arg(
            Arg::new("image")
                .short('i')
                .long("image")
                .default_value("fat32.img")
                .help("Path to the backing disk image (created if missing)"),
        )
        .get_matches();

    let image_path = matches.get_one::<String>("image").unwrap();

    let device: Arc<dyn BlockDevice> = match StdBlockDevice::open(image_path) {
        Ok(dev) => Arc::new(dev),
        Err(e) => {
            eprintln!("Error: Failed to open disk image: {e}");
            std::process::exit(1);
        }
    };

    let mut fs = match FileSystem::mount(Arc::clone(&device)) {
        Ok(fs) => Some(fs),
        Err(_) => {
            log::warn!("mounted image is not a valid FAT32 volume; run `format` first");
            None
        }
    };

    run_repl(&mut fs, device);
}

fn run_repl(fs: &mut Option<FileSystem>, device: Arc<dyn BlockDevice>) {
    loop {
        let prompt = fs.as_ref().map(|f| f.cwd().to_string()).unwrap_or_else(|| "?".to_string());
        print!("{prompt}> ");
        if io::stdout().flush().is_err() {
            break;
        }

        let mut line = String::new();
        if io::stdin().read_line(&mut line).unwrap_or(0) == 0 {
            break; // EOF
        }

        let mut parts = line.trim().split_whitespace();
        let cmd = match parts.next() {
            Some(c) => c,
            None => continue,
        };
        let arg = parts.next();

        match cmd {
            "format" => match FileSystem::format(Arc::clone(&device), 0) {
                Ok(new_fs) => {
                    *fs = Some(new_fs);
                    println!("Ok");
                }
                Err(e) => {
                    log::error!("format failed: {e}");
                    println!("Error: Failed to format disk");
                }
            },

            "ls" => match fs.as_ref() {
                None => println!("Unknown disk format"),
                Some(fs) => match fs.ls(arg) {
                    Ok(entries) => {
                        for (name, _is_dir) in entries {
                            println!("{name}");
                        }
                    }
                    Err(e) => {
                        log::error!("ls failed: {e}");
                        println!("Error: Failed to list directory");
                    }
                },
            },

            "cd" => match fs.as_mut() {
                None => println!("Unknown disk format"),
                Some(fs) => {
                    let target = arg.unwrap_or("/");
                    if fs.cd(target).is_err() {
                        println!("Error: Directory not found");
                    }
                }
            },

            "mkdir" => match fs.as_mut() {
                None => println!("Unknown disk format"),
                Some(fs) => match arg {
                    None => println!("Error: Failed to create directory"),
                    Some(name) => match fs.mkdir(name) {
                        Ok(()) => println!("Ok"),
                        Err(e) => {
                            log::error!("mkdir failed: {e}");
                            println!("Error: Failed to create directory");
                        }
                    },
                },
            },

            "touch" => match fs.as_mut() {
                None => println!("Unknown disk format"),
                Some(fs) => match arg {
                    None => println!("Error: Failed to create file"),
                    Some(name) => match fs.touch(name) {
                        Ok(()) => println!("Ok"),
                        Err(e) => {
                            log::error!("touch failed: {e}");
                            println!("Error: Failed to create file");
                        }
                    },
                },
            },

            "help" => print_help(),

            "exit" | "quit" => {
                sync_all();
                break;
            }

            other => println!("Error: Unknown command '{other}' (try 'help')"),
        }
    }
}

fn print_help() {
    println!("format          format the mounted volume");
    println!("ls [path]       list entries of path, or the current directory");
    println!("cd <path>       change the current directory");
    println!("mkdir <name>    create a directory in the current directory");
    println!("touch <name>    create an empty file in the current directory");
    println!("help            show this message");
    println!("exit, quit      leave the shell");
}
