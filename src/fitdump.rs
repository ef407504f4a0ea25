use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use env_logger::Env;
use fitload::dtb::DtNode;
use fitload::fit::{self, FitImage, FIT_CONFS_PATH, FIT_DATA_PROP, FIT_DESC_PROP, FIT_IMAGES_PATH};
use fitload::signature::{is_signature_node, FIT_ALGO_PROP, FIT_KEY_HINT_PROP, FIT_SIGNER_NAME_PROP};
use fitload::{printable, Result};

/// List and extract the contents of U-Boot FIT images.
#[derive(Parser, Debug)]
#[command(
    name = "fitdump",
    version,
    about = "List and extract images from U-Boot FIT images"
)]
struct Cli {
    /// List configurations, images and signature nodes
    #[arg(short = 'l')]
    list: bool,

    /// Name of the image under /images to extract
    #[arg(short = 'i')]
    image_name: Option<String>,

    /// Extract the image to this file
    #[arg(short = 'o')]
    outfile: Option<PathBuf>,

    /// The input FIT image
    #[arg()]
    imagefile: PathBuf,
}

fn size_str(size: usize) -> String {
    if size >= 1024 * 1024 {
        format!(
            "{} Bytes = {:.2} MiB",
            size,
            size as f64 / (1024.0 * 1024.0)
        )
    } else if size >= 1024 {
        format!("{} Bytes = {:.2} KiB", size, size as f64 / 1024.0)
    } else {
        format!("{size} Bytes")
    }
}

fn text(node: &DtNode, prop: &str) -> String {
    node.property(prop).map(printable).unwrap_or_default()
}

fn print_fit_info(image: &FitImage) {
    println!(
        "FIT description: {}",
        image.description().unwrap_or_default()
    );
    if let Some(ts) = image.timestamp() {
        match chrono::DateTime::from_timestamp(ts as i64, 0) {
            Some(dt) => println!("Created:         {}", dt.format("%a %b %d %H:%M:%S %Y")),
            None => println!("Created:         (invalid timestamp)"),
        }
    }

    let tree = image.tree();
    if let Some(images) = tree.walk(FIT_IMAGES_PATH) {
        for (i, node) in images.children.iter().enumerate() {
            println!(" Image {i} ({})", node.name);
            println!("  Description:  {}", text(node, FIT_DESC_PROP));
            match node.property(FIT_DATA_PROP) {
                Some(data) => println!("  Data Size:    {}", size_str(data.len())),
                None => println!("  Data Size:    unavailable"),
            }
            for sig in node.children_matching(is_signature_node) {
                println!("  Sign algo:    {} ({})", text(sig, FIT_ALGO_PROP), sig.name);
                let signer = text(sig, FIT_SIGNER_NAME_PROP);
                if !signer.is_empty() {
                    println!("  Signer:       {signer}");
                }
                let hint = text(sig, FIT_KEY_HINT_PROP);
                if !hint.is_empty() {
                    println!("  Key hint:     {hint}");
                }
            }
        }
    }

    if let Some(confs) = tree.walk(FIT_CONFS_PATH) {
        println!(" Default Configuration: '{}'", text(confs, fit::FIT_DEFAULT_PROP));
        for (i, node) in confs.children.iter().enumerate() {
            println!(" Configuration {i} ({})", node.name);
            println!("  Description:  {}", text(node, FIT_DESC_PROP));
            println!("  Kernel:       {}", text(node, fit::FIT_KERNEL_PROP));
            let ramdisk = text(node, fit::FIT_RAMDISK_PROP);
            if !ramdisk.is_empty() {
                println!("  Init Ramdisk: {ramdisk}");
            }
        }
    }
}

fn list_image(path: &Path) -> Result<()> {
    let image = FitImage::new(path)?;
    print_fit_info(&image);
    Ok(())
}

fn extract_image(path: &Path, name: &str, outfile: &Path) -> Result<()> {
    let image = FitImage::new(path)?;
    let data = image.read_image(name)?;
    fs::write(outfile, &data)?;
    log::info!("{name}: wrote {} to {}", size_str(data.len()), outfile.display());
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    // -l and -o are mutually exclusive
    if cli.list && cli.outfile.is_some() {
        eprintln!("fitdump: -l and -o are mutually exclusive");
        process::exit(1);
    }

    if cli.list {
        if let Err(e) = list_image(&cli.imagefile) {
            eprintln!("fitdump: {}: {}", cli.imagefile.display(), e);
            process::exit(1);
        }
        return;
    }

    let (Some(name), Some(outfile)) = (&cli.image_name, &cli.outfile) else {
        eprintln!(
            "Usage: fitdump -l image\n\
             \x20      fitdump -i name -o outfile image"
        );
        process::exit(1);
    };
    if let Err(e) = extract_image(&cli.imagefile, name, outfile) {
        eprintln!(
            "fitdump: Can't extract {} from {}: {}",
            name,
            cli.imagefile.display(),
            e
        );
        process::exit(1);
    }
}
