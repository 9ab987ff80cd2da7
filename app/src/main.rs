// Licensed under the Apache-2.0 license

//! Developer CLI for the bring-up pipeline: inspect VBIOS images and
//! exercise the boot flow against the software GPU model.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use gsp_bringup::wpr::BootloaderSections;
use gsp_bringup::{BringupSession, GspSystemInfo, PrimaryFirmware};
use gsp_config::ADA_CONFIG;
use gsp_hw_model::EmulatedGpu;
use gsp_vbios::FwsecUcode;

#[derive(Parser)]
#[command(version, about = "GPU security processor bring-up tools", long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a VBIOS image and describe its FWSEC ucode
    Inspect {
        /// VBIOS ROM image
        rom: PathBuf,
    },
    /// Run FWSEC-FRTS on the software model and report WPR2
    Frts {
        /// VBIOS ROM image
        rom: PathBuf,

        /// Framebuffer byte offset of the FRTS carve-out
        #[arg(long, value_parser = maybe_hex::<u64>, default_value = "0x3ff00000")]
        frts_offset: u64,

        /// Raw GSP ucode-version fuse word (unary version counter)
        #[arg(long, value_parser = maybe_hex::<u32>, default_value = "0")]
        fuse: u32,
    },
    /// Run the full boot flow on the software model, up to a live RPC
    /// channel
    Boot {
        /// VBIOS ROM image
        rom: PathBuf,

        /// GSP-RM firmware ELF; a synthetic payload when omitted
        #[arg(long)]
        elf: Option<PathBuf>,

        #[arg(long, value_parser = maybe_hex::<u64>, default_value = "0x3ff00000")]
        frts_offset: u64,

        #[arg(long, value_parser = maybe_hex::<u32>, default_value = "0")]
        fuse: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    simple_logger::SimpleLogger::new()
        .with_level(cli.log_level)
        .init()?;

    match cli.command {
        Commands::Inspect { rom } => inspect(&rom),
        Commands::Frts {
            rom,
            frts_offset,
            fuse,
        } => frts(&rom, frts_offset, fuse).map(|_| ()),
        Commands::Boot {
            rom,
            elf,
            frts_offset,
            fuse,
        } => boot(&rom, elf.as_deref(), frts_offset, fuse),
    }
}

fn extract(rom: &Path) -> Result<FwsecUcode> {
    let data = std::fs::read(rom).with_context(|| format!("reading {}", rom.display()))?;
    let ucode = gsp_vbios::extract_fwsec(&data, ADA_CONFIG.known_rom_offsets)
        .with_context(|| format!("no FWSEC ucode in {}", rom.display()))?;
    Ok(ucode)
}

fn inspect(rom: &Path) -> Result<()> {
    let ucode = extract(rom)?;
    let desc = &ucode.desc;
    println!("FWSEC descriptor at {:#x}", ucode.desc_offset);
    println!("  version          {}", desc.version());
    println!("  ucode id         {}", desc.ucode_id);
    println!("  engine id mask   {:#06x}", desc.engine_id_mask);
    println!(
        "  IMEM             {:#x} bytes, virt base {:#x}",
        desc.imem_load_size, desc.imem_virt_base
    );
    println!("  DMEM             {:#x} bytes", desc.dmem_load_size);
    println!("  boot vector      {:#x}", desc.boot_vector());
    println!(
        "  signatures       {} (version mask {:#06x})",
        desc.signature_count, desc.signature_versions
    );
    for i in 0..usize::from(desc.signature_count) {
        if let Some(sig) = ucode.signature(i) {
            println!("    [{}] {}…", i, hex::encode(&sig[..12]));
        }
    }
    Ok(())
}

fn frts(rom: &Path, frts_offset: u64, fuse: u32) -> Result<EmulatedGpu> {
    let mut ucode = extract(rom)?;
    let mut dev = EmulatedGpu::new(&ADA_CONFIG);
    if fuse != 0 {
        dev.set_fuse_version(
            ADA_CONFIG.fuse_gsp_ucode_version_base,
            ucode.desc.ucode_id,
            fuse,
        );
    }

    let mut session = BringupSession::new(&mut dev, &ADA_CONFIG);
    let region = session
        .run_fwsec_frts(&mut ucode, frts_offset)
        .context("FWSEC-FRTS failed")?;
    println!("WPR2 active: {:#x}..{:#x}", region.lo, region.hi);
    drop(session);
    Ok(dev)
}

fn boot(rom: &Path, elf: Option<&Path>, frts_offset: u64, fuse: u32) -> Result<()> {
    let elf_data = match elf {
        Some(path) => std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
        // Something multi-page for the Radix3 walk to chew on.
        None => (0..0x4_2000).map(|i| (i % 247) as u8).collect(),
    };
    let bootloader = vec![0u8; 0x2000];
    let signature = vec![0u8; 384];
    let firmware = PrimaryFirmware {
        elf: &elf_data,
        bootloader: &bootloader,
        sections: BootloaderSections::default(),
        signature: &signature,
    };

    let mut dev = frts(rom, frts_offset, fuse)?;
    let mut session = BringupSession::new(&mut dev, &ADA_CONFIG);
    session
        .boot_primary_core(&firmware)
        .context("primary core boot failed")?;
    println!("RISC-V core active");

    while !session.init_done() {
        session.rpc_poll_event().context("status queue")?;
    }
    println!("firmware init done");

    let reply = session
        .rpc_set_system_info(&GspSystemInfo {
            pci_vendor_id: 0x10DE,
            ..Default::default()
        })
        .context("SET_SYSTEM_INFO rpc")?;
    println!(
        "RPC channel up: fn {:#x} answered with {} parameter bytes",
        reply.header.function,
        reply.params.len()
    );
    Ok(())
}
