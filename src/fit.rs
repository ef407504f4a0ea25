//! FIT (Flattened Image Tree) boot images.
//!
//! A [`FitImage`] walks one `.itb` through the boot flow:
//! 1. Select a configuration under `/configurations` and resolve the kernel /
//!    ramdisk image names it references
//! 2. Extract each image's `data` from `/images/<name>`
//! 3. Verify the image's `signature*` nodes against the operator key ring
//! 4. Place the bytes in kexec segments and hand them to a [`KexecLoader`]
//!
//! Verification is fail-closed: an image with signature nodes that do not
//! verify is not loaded unless [`LoadOptions::allow_unverified`] is set.

use std::fmt;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use log::{debug, log, warn, Level};

use crate::dtb::{self, DtNode};
use crate::kexec::{KexecLoader, Range, Segment, Segments, SyscallLoader};
use crate::keyring::KeyRing;
use crate::signature::{is_signature_node, parse_signatures, verify_signatures};
use crate::vfile::Checked;
use crate::{printable, FitError, Result};

// ---------------------------------------------------------------------------
// FIT property / node name constants (matching U-Boot's image.h)
// ---------------------------------------------------------------------------

pub const FIT_IMAGES_PATH: &str = "/images";
pub const FIT_CONFS_PATH: &str = "/configurations";

pub const FIT_DEFAULT_PROP: &str = "default";
pub const FIT_KERNEL_PROP: &str = "kernel";
pub const FIT_RAMDISK_PROP: &str = "ramdisk";
pub const FIT_ROOTFS_PROP: &str = "rootfs";
pub const FIT_DATA_PROP: &str = "data";
pub const FIT_DESC_PROP: &str = "description";
pub const FIT_TIMESTAMP_PROP: &str = "timestamp";

/// FIT files are read whole; anything larger is refused up front.
pub const MAX_FIT_SIZE: u64 = 1 << 30;

pub const DEFAULT_KERNEL_ADDR: u64 = 0x0100_0000;
pub const DEFAULT_INITRAMFS_ADDR: u64 = 0x0800_0000;
pub const DEFAULT_CMDLINE_ADDR: u64 = 0x0009_0000;

// ---------------------------------------------------------------------------
// Load policy
// ---------------------------------------------------------------------------

/// Where a [`FitImage`] is in the boot flow. `Loaded` and `Failed` are
/// terminal; another attempt needs a fresh image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Configured,
    Loaded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Log each load step at `info` instead of `debug`.
    pub verbose: bool,
    /// Load images whose signatures fail to verify, with a warning.
    pub allow_unverified: bool,
    pub kernel_addr: u64,
    pub initramfs_addr: u64,
    pub cmdline_addr: u64,
    /// Passed through to `kexec_load(2)`.
    pub flags: u64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            allow_unverified: false,
            kernel_addr: DEFAULT_KERNEL_ADDR,
            initramfs_addr: DEFAULT_INITRAMFS_ADDR,
            cmdline_addr: DEFAULT_CMDLINE_ADDR,
            flags: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration selection
// ---------------------------------------------------------------------------

/// Image names referenced by one configuration node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Selection {
    config: String,
    kernel: String,
    ramdisk: String,
    rootfs: String,
}

/// First string of a property, without non-printable characters.
fn prop_text(node: &DtNode, name: &str) -> Option<String> {
    let value = node.property(name)?;
    let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
    Some(printable(&value[..end])).filter(|s| !s.is_empty())
}

fn select_config(tree: &DtNode, config_override: Option<&str>) -> Result<Selection> {
    let confs = tree.walk(FIT_CONFS_PATH).ok_or(FitError::NoConfigurations)?;
    let config = match config_override {
        Some(name) => name.to_string(),
        None => prop_text(confs, FIT_DEFAULT_PROP).ok_or(FitError::ConfigDefaultMissing)?,
    };
    let node = confs
        .child(&config)
        .ok_or_else(|| FitError::ConfigMiss(config.clone()))?;
    let kernel =
        prop_text(node, FIT_KERNEL_PROP).ok_or_else(|| FitError::ConfigNoKernel(config.clone()))?;
    Ok(Selection {
        kernel,
        ramdisk: prop_text(node, FIT_RAMDISK_PROP).unwrap_or_default(),
        rootfs: prop_text(node, FIT_ROOTFS_PROP).unwrap_or_default(),
        config,
    })
}

// ---------------------------------------------------------------------------
// FitImage
// ---------------------------------------------------------------------------

/// One FIT file under verification.
pub struct FitImage {
    tree: Rc<DtNode>,
    config: String,
    kernel: String,
    initramfs: String,
    rootfs: String,
    config_override: Option<String>,
    cmdline: String,
    key_ring: Option<KeyRing>,
    boot_rank: i32,
    state: LoadState,
}

impl FitImage {
    /// Read and parse the FIT file at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = read_fit_file(path.as_ref())?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_tree(Rc::new(dtb::parse_dtb(bytes)?)))
    }

    fn from_tree(tree: Rc<DtNode>) -> Self {
        Self {
            tree,
            config: String::new(),
            kernel: String::new(),
            initramfs: String::new(),
            rootfs: String::new(),
            config_override: None,
            cmdline: String::new(),
            key_ring: None,
            boot_rank: 0,
            state: LoadState::Unloaded,
        }
    }

    pub fn tree(&self) -> &DtNode {
        &self.tree
    }

    pub fn set_config_override(&mut self, name: Option<&str>) {
        self.config_override = name.map(str::to_string);
    }

    pub fn config_override(&self) -> Option<&str> {
        self.config_override.as_deref()
    }

    pub fn set_cmdline(&mut self, cmdline: &str) {
        self.cmdline = cmdline.to_string();
    }

    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    /// `None` leaves no trust material: every signature check fails closed.
    pub fn set_key_ring(&mut self, key_ring: Option<KeyRing>) {
        self.key_ring = key_ring;
    }

    pub fn key_ring(&self) -> Option<&KeyRing> {
        self.key_ring.as_ref()
    }

    /// Name the kernel image directly, bypassing configuration selection.
    pub fn set_kernel(&mut self, name: &str) {
        self.kernel = name.to_string();
    }

    pub fn kernel(&self) -> &str {
        &self.kernel
    }

    pub fn set_initramfs(&mut self, name: &str) {
        self.initramfs = name.to_string();
    }

    pub fn initramfs(&self) -> &str {
        &self.initramfs
    }

    pub fn set_rootfs(&mut self, name: &str) {
        self.rootfs = name.to_string();
    }

    pub fn rootfs(&self) -> &str {
        &self.rootfs
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn rank(&self) -> i32 {
        self.boot_rank
    }

    pub fn set_rank(&mut self, rank: i32) {
        self.boot_rank = rank;
    }

    /// Configuration this image was resolved from, or the requested one.
    pub fn config_name(&self) -> &str {
        if !self.config.is_empty() {
            &self.config
        } else {
            self.config_override.as_deref().unwrap_or("default")
        }
    }

    /// Menu label, e.g. `FIT conf@1 (kernel: kernel@0, initramfs: ramdisk@0)`.
    pub fn label(&self) -> String {
        format!(
            "FIT {} (kernel: {}, initramfs: {})",
            self.config_name(),
            self.kernel,
            self.initramfs
        )
    }

    /// Root `description` property, if any.
    pub fn description(&self) -> Option<String> {
        prop_text(&self.tree, FIT_DESC_PROP)
    }

    /// Root `timestamp` property (seconds since the epoch).
    pub fn timestamp(&self) -> Option<u32> {
        self.tree.property_u32(FIT_TIMESTAMP_PROP)
    }

    /// Resolve the override (or the `default` configuration) to kernel and
    /// ramdisk image names. The ramdisk name is empty when the
    /// configuration has none. On failure both names are cleared.
    pub fn resolve_config(&mut self) -> Result<(String, String)> {
        self.config.clear();
        self.kernel.clear();
        self.initramfs.clear();
        self.rootfs.clear();

        let sel = select_config(&self.tree, self.config_override.as_deref())?;
        debug!(
            "config {}: kernel '{}', ramdisk '{}'",
            sel.config, sel.kernel, sel.ramdisk
        );
        self.config = sel.config;
        self.kernel = sel.kernel;
        self.initramfs = sel.ramdisk;
        self.rootfs = sel.rootfs;
        if self.state == LoadState::Unloaded {
            self.state = LoadState::Configured;
        }
        Ok((self.kernel.clone(), self.initramfs.clone()))
    }

    fn image_node(&self, name: &str) -> Result<&DtNode> {
        self.tree
            .walk(FIT_IMAGES_PATH)
            .and_then(|images| images.child(name))
            .ok_or_else(|| FitError::ImageNotFound(name.to_string()))
    }

    /// Raw `data` of `/images/<name>`, unverified.
    pub fn read_image(&self, name: &str) -> Result<Vec<u8>> {
        self.image_node(name)?
            .property(FIT_DATA_PROP)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| FitError::ImageNoData(name.to_string()))
    }

    /// `data` of `/images/<name>` checked against the image's signature
    /// nodes. An image without usable signatures is rejected with
    /// `NoValidSignatures`. Extraction failures are the only `Err`.
    pub fn read_signed_image(
        &self,
        name: &str,
        key_ring: Option<&KeyRing>,
    ) -> Result<Checked<Vec<u8>>> {
        let node = self.image_node(name)?;
        let data = self.read_image(name)?;
        let sig_nodes = node.children_matching(is_signature_node);
        match parse_signatures(&sig_nodes) {
            Ok(sigs) => Ok(verify_signatures(&sigs, data, key_ring)),
            Err(e @ FitError::NoValidSignatures) => Ok(Checked::rejected(data, e)),
            Err(e) => Err(e),
        }
    }

    /// Image bytes to boot, per the load policy.
    fn boot_image(&self, name: &str, opts: &LoadOptions, level: Level) -> Result<Vec<u8>> {
        let node = self.image_node(name)?;
        if node.children_matching(is_signature_node).is_empty() {
            log!(level, "{name}: no signature nodes, loading unverified");
            return self.read_image(name);
        }
        let checked = self.read_signed_image(name, self.key_ring.as_ref())?;
        if opts.allow_unverified {
            return Ok(checked.or_warn());
        }
        let data = checked.into_verified()?;
        log!(level, "{name}: signature verified");
        Ok(data)
    }

    /// Verify and hand the selected images to `kexec_load(2)`.
    pub fn load(&mut self, verbose: bool) -> Result<()> {
        let opts = LoadOptions {
            verbose,
            ..LoadOptions::default()
        };
        self.load_with(&mut SyscallLoader, &opts)
    }

    /// Verify the selected images, build their segments and hand them to
    /// `loader`. Succeeds or fails once: any later call returns
    /// `AlreadyAttempted`.
    pub fn load_with<L: KexecLoader + ?Sized>(
        &mut self,
        loader: &mut L,
        opts: &LoadOptions,
    ) -> Result<()> {
        if matches!(self.state, LoadState::Loaded | LoadState::Failed) {
            return Err(FitError::AlreadyAttempted);
        }
        let result = self.try_load(loader, opts);
        self.state = match result {
            Ok(()) => LoadState::Loaded,
            Err(_) => LoadState::Failed,
        };
        result
    }

    fn try_load<L: KexecLoader + ?Sized>(&self, loader: &mut L, opts: &LoadOptions) -> Result<()> {
        let level = if opts.verbose {
            Level::Info
        } else {
            Level::Debug
        };

        if self.kernel.is_empty() {
            return Err(FitError::NoKernelSelected);
        }
        if !self.rootfs.is_empty() {
            return Err(FitError::UnsupportedRootfs(self.rootfs.clone()));
        }

        let mut segments = Segments::new();

        let kernel = self.boot_image(&self.kernel, opts, level)?;
        if kernel.is_empty() {
            return Err(FitError::ImageNoData(self.kernel.clone()));
        }
        log!(
            level,
            "kernel {}: {} bytes at {:#x}",
            self.kernel,
            kernel.len(),
            opts.kernel_addr
        );
        segments.insert(Segment::at(kernel, opts.kernel_addr))?;

        if !self.initramfs.is_empty() {
            let initramfs = self.boot_image(&self.initramfs, opts, level)?;
            log!(
                level,
                "initramfs {}: {} bytes at {:#x}",
                self.initramfs,
                initramfs.len(),
                opts.initramfs_addr
            );
            segments.insert(Segment::at(initramfs, opts.initramfs_addr))?;
        }

        if !self.cmdline.is_empty() {
            let mut cmdline = self.cmdline.as_bytes().to_vec();
            cmdline.push(0);
            log!(level, "cmdline '{}' at {:#x}", self.cmdline, opts.cmdline_addr);
            let phys = Range::new(opts.cmdline_addr, cmdline.len() as u64);
            segments.insert(Segment::new(cmdline, phys))?;
        }

        loader
            .load(opts.kernel_addr, &segments, opts.flags)
            .map_err(|e| match e {
                FitError::LoaderFailure(_) => e,
                other => FitError::LoaderFailure(other.to_string()),
            })
    }
}

impl fmt::Debug for FitImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FitImage")
            .field("label", &self.label())
            .field("config_override", &self.config_override)
            .field("cmdline", &self.cmdline)
            .field("key_ring", &self.key_ring)
            .field("rank", &self.boot_rank)
            .field("state", &self.state)
            .finish()
    }
}

fn read_fit_file(path: &Path) -> Result<Vec<u8>> {
    let size = fs::metadata(path)?.len();
    if size > MAX_FIT_SIZE {
        return Err(FitError::TooLarge {
            what: "FIT image",
            size,
            max: MAX_FIT_SIZE,
        });
    }
    Ok(fs::read(path)?)
}

/// One image per `/configurations` child, each with its override set and
/// names resolved. Configurations that do not resolve are skipped.
pub fn parse_configs(bytes: &[u8]) -> Result<Vec<FitImage>> {
    let tree = Rc::new(dtb::parse_dtb(bytes)?);
    let confs = tree.walk(FIT_CONFS_PATH).ok_or(FitError::NoConfigurations)?;

    let mut images = Vec::new();
    for conf in &confs.children {
        let mut image = FitImage::from_tree(Rc::clone(&tree));
        image.set_config_override(Some(&conf.name));
        match image.resolve_config() {
            Ok(_) => images.push(image),
            Err(e) => warn!("skipping configuration {}: {e}", conf.name),
        }
    }
    Ok(images)
}

pub fn parse_configs_file<P: AsRef<Path>>(path: P) -> Result<Vec<FitImage>> {
    parse_configs(&read_fit_file(path.as_ref())?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
