//! Command-line interface implementation.
//!
//! The subcommands mirror the build rules that invoke them: one
//! subcommand per build action (layer assembly, manifest/index
//! synthesis, OCI layout output, deployment). Flag values are plain
//! paths handed over by the build system; nothing here prompts or reads
//! configuration files beyond what the flags name.

use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use fn_error_context::context;
use oci_spec::image::{
    Arch, Descriptor, ImageConfiguration, ImageIndexBuilder, ImageManifest,
    ImageManifestBuilder, MediaType, Os, PlatformBuilder, RootFsBuilder, SCHEMA_VERSION,
};

use crate::compress::seekable::SeekableWriter;
use crate::compress::{Appender, AppenderState, CompressionAlgorithm};
use crate::contentmanifest;
use crate::deploy::DeployManifest;
use crate::hash::{HashAlgorithm, HashValue};
use crate::oci::BlobMetadata;
use crate::recorder::{self, Recorder, StaticMetadata};
use crate::registry::{RegistryApi, RegistryClient};
use crate::tarcas::{StructuralMode, TarCas};

/// Shared inputs of the layer-assembly subcommand.
#[derive(Debug, clap::Parser)]
pub(crate) struct LayerOpts {
    /// Output path of the (compressed) layer blob.
    #[clap(long)]
    output: Utf8PathBuf,
    /// Output path of the layer metadata JSON.
    #[clap(long)]
    metadata_out: Option<Utf8PathBuf>,
    /// Output path of the content manifest.
    #[clap(long)]
    content_manifest_out: Option<Utf8PathBuf>,
    /// File parameter manifest (`path NUL type host-path` lines).
    #[clap(long)]
    file_manifest: Option<Utf8PathBuf>,
    /// Symlink parameter manifest (`link NUL target` lines).
    #[clap(long)]
    symlink_manifest: Option<Utf8PathBuf>,
    /// Tars to import (possibly compressed); applied first.
    #[clap(long = "import")]
    imports: Vec<Utf8PathBuf>,
    /// Content manifests of lower layers, for cross-layer dedup.
    #[clap(long = "import-manifest")]
    import_manifests: Vec<Utf8PathBuf>,
    /// File listing further content manifest paths, one per line.
    #[clap(long)]
    import_collection: Option<Utf8PathBuf>,
    /// JSON file with header overrides (mode/uid/gid/mtime/pax).
    #[clap(long)]
    metadata: Option<Utf8PathBuf>,
    /// Known digest for a host path: `HOST=DIGEST=SIZE`. Skips
    /// re-hashing that file.
    #[clap(long = "known-digest")]
    known_digests: Vec<String>,
    /// Compression algorithm.
    #[clap(long, default_value = "gzip")]
    compress: CompressionAlgorithm,
    /// Hash algorithm.
    #[clap(long, default_value = "sha256")]
    hash: HashAlgorithm,
    /// Structural mode: cas-first, intertwined, or cas-only.
    #[clap(long, default_value = "cas-first")]
    structure: String,
    /// Emit a seekable (eStargz) layer with a TOC and footer.
    #[clap(long)]
    estargz: bool,
    /// Output path for the span table of a seekable layer.
    #[clap(long)]
    zinfo_out: Option<Utf8PathBuf>,
}

#[derive(Debug, clap::Parser)]
pub(crate) struct LayerMetadataOpts {
    /// The blob to describe.
    #[clap(long)]
    blob: Utf8PathBuf,
    /// Media type to record.
    #[clap(long, default_value = "application/vnd.oci.image.layer.v1.tar+gzip")]
    media_type: String,
    /// Hash algorithm.
    #[clap(long, default_value = "sha256")]
    hash: HashAlgorithm,
    /// Also compute the uncompressed digest (DiffID).
    #[clap(long)]
    diff_id: bool,
    /// Output path of the metadata JSON.
    #[clap(long)]
    output: Utf8PathBuf,
}

#[derive(Debug, clap::Parser)]
pub(crate) struct ManifestOpts {
    /// Base image configuration JSON to extend (optional).
    #[clap(long)]
    base_config: Option<Utf8PathBuf>,
    /// Target operating system for the config.
    #[clap(long)]
    os: Option<String>,
    /// Target architecture for the config.
    #[clap(long)]
    arch: Option<String>,
    /// Layer metadata JSONs, in order.
    #[clap(long = "layer")]
    layers: Vec<Utf8PathBuf>,
    /// Output path of the config blob.
    #[clap(long)]
    config_out: Utf8PathBuf,
    /// Output path of the manifest JSON.
    #[clap(long)]
    output: Utf8PathBuf,
    /// Output path of the manifest metadata JSON.
    #[clap(long)]
    metadata_out: Option<Utf8PathBuf>,
}

#[derive(Debug, clap::Parser)]
pub(crate) struct IndexOpts {
    /// Manifest metadata JSONs, in order.
    #[clap(long = "manifest")]
    manifests: Vec<Utf8PathBuf>,
    /// Platform (`os/arch[/variant]`) per manifest, aligned by position.
    #[clap(long = "platform")]
    platforms: Vec<String>,
    /// Output path of the index JSON.
    #[clap(long)]
    output: Utf8PathBuf,
    /// Output path of the index metadata JSON.
    #[clap(long)]
    metadata_out: Option<Utf8PathBuf>,
}

#[derive(Debug, clap::Parser)]
pub(crate) struct OciLayoutOpts {
    /// The index JSON for the layout.
    #[clap(long)]
    index: Utf8PathBuf,
    /// Blobs to place, as `DIGEST=PATH`.
    #[clap(long = "blob")]
    blobs: Vec<String>,
    /// Output directory (exclusive with --tar).
    #[clap(long)]
    output: Option<Utf8PathBuf>,
    /// Output tar path (exclusive with --output).
    #[clap(long)]
    tar: Option<Utf8PathBuf>,
}

#[derive(Debug, clap::Parser)]
pub(crate) struct CompressOpts {
    /// Input file.
    #[clap(long)]
    input: Utf8PathBuf,
    /// Output file; appended to when resuming.
    #[clap(long)]
    output: Utf8PathBuf,
    /// Appender state to resume from.
    #[clap(long)]
    state_in: Option<Utf8PathBuf>,
    /// Where to write the appender state.
    #[clap(long)]
    state_out: Option<Utf8PathBuf>,
    /// Compression algorithm.
    #[clap(long, default_value = "gzip")]
    compress: CompressionAlgorithm,
    /// Hash algorithm.
    #[clap(long, default_value = "sha256")]
    hash: HashAlgorithm,
    /// Output path of the blob metadata JSON.
    #[clap(long)]
    metadata_out: Option<Utf8PathBuf>,
}

#[derive(Debug, clap::Parser)]
pub(crate) struct ValidateOpts {
    /// The blob to verify.
    #[clap(long)]
    blob: Utf8PathBuf,
    /// The metadata JSON describing the expected digest and size.
    #[clap(long)]
    metadata: Utf8PathBuf,
}

#[derive(Debug, clap::Parser)]
pub(crate) struct PushOpts {
    /// The deploy manifest.
    #[clap(long)]
    deploy_manifest: Utf8PathBuf,
    /// Root directory holding the materialized deploy inputs.
    #[clap(long)]
    root: Utf8PathBuf,
    /// Upload worker count.
    #[clap(long, default_value_t = crate::push::DEFAULT_JOBS)]
    jobs: usize,
    /// Downgrade unsourced blobs to stubs instead of failing.
    #[clap(long)]
    allow_missing: bool,
}

#[derive(Debug, clap::Parser)]
pub(crate) struct DeployMetadataOpts {
    /// Operation JSON fragments, in order.
    #[clap(long = "operation")]
    operations: Vec<Utf8PathBuf>,
    /// Push strategy.
    #[clap(long, default_value = "eager")]
    push_strategy: String,
    /// Load strategy.
    #[clap(long, default_value = "eager")]
    load_strategy: String,
    /// Output path of the deploy manifest.
    #[clap(long)]
    output: Utf8PathBuf,
}

#[derive(Debug, clap::Parser)]
pub(crate) struct DeployMergeOpts {
    /// Deploy manifests to merge.
    inputs: Vec<Utf8PathBuf>,
    /// Output path of the merged manifest.
    #[clap(long)]
    output: Utf8PathBuf,
}

#[derive(Debug, clap::Parser)]
pub(crate) struct DockerSaveOpts {
    /// The deploy manifest (its first load operation is saved).
    #[clap(long)]
    deploy_manifest: Utf8PathBuf,
    /// Root directory holding the materialized deploy inputs.
    #[clap(long)]
    root: Utf8PathBuf,
    /// Platform to select from an index root.
    #[clap(long)]
    platform: Option<String>,
    /// Output tar path, or `-` for stdout.
    #[clap(long)]
    output: Utf8PathBuf,
}

#[derive(Debug, clap::Parser)]
pub(crate) struct DownloadBlobOpts {
    /// Registry hostname.
    #[clap(long)]
    registry: String,
    /// Repository below the registry.
    #[clap(long)]
    repository: String,
    /// Digest of the blob.
    #[clap(long)]
    digest: String,
    /// Output path.
    #[clap(long)]
    output: Utf8PathBuf,
}

#[derive(Debug, clap::Parser)]
pub(crate) struct ExpandTemplateOpts {
    /// Template file with `{{key}}` placeholders.
    #[clap(long)]
    template: Utf8PathBuf,
    /// Output path.
    #[clap(long)]
    output: Utf8PathBuf,
    /// `key=value` substitutions.
    #[clap(long = "set")]
    set: Vec<String>,
    /// `key=ENV_VAR` substitutions from the environment.
    #[clap(long = "set-from-env")]
    set_from_env: Vec<String>,
}

/// The `img` CLI.
#[derive(Debug, Parser)]
#[clap(name = "img", rename_all = "kebab-case", version)]
#[allow(clippy::large_enum_variant)]
pub(crate) enum Opt {
    /// Assemble a content-addressed layer from build inputs.
    Layer(LayerOpts),
    /// Describe an existing blob (digest, size, optional DiffID).
    LayerMetadata(LayerMetadataOpts),
    /// Synthesize an image manifest and config from layer metadata.
    Manifest(ManifestOpts),
    /// Synthesize an image index from manifest metadata.
    Index(IndexOpts),
    /// Assemble an OCI image layout directory or tar.
    OciLayout(OciLayoutOpts),
    /// Compress a file with resumable appender state.
    Compress(CompressOpts),
    /// Verify a blob against its metadata.
    Validate(ValidateOpts),
    /// Push images per a deploy manifest.
    Push(PushOpts),
    /// Assemble a deploy manifest from operation fragments.
    DeployMetadata(DeployMetadataOpts),
    /// Merge deploy manifests.
    DeployMerge(DeployMergeOpts),
    /// Write a `docker load` compatible tar for an image.
    DockerSave(DockerSaveOpts),
    /// Download one blob from a registry.
    DownloadBlob(DownloadBlobOpts),
    /// Expand `{{key}}` placeholders in a template file.
    ExpandTemplate(ExpandTemplateOpts),
}

fn parse_structural_mode(s: &str) -> Result<StructuralMode> {
    match s {
        "cas-first" => Ok(StructuralMode::CasFirst),
        "intertwined" => Ok(StructuralMode::Intertwined),
        "cas-only" => Ok(StructuralMode::CasOnly),
        o => anyhow::bail!("Unknown structural mode {o}"),
    }
}

fn write_json<T: serde::Serialize>(path: &Utf8Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, data).with_context(|| format!("Writing {path}"))
}

/// Run the recorder operations shared by every layer-assembly flavor.
fn assemble_layer<W: Write>(cas: TarCas<W>, opts: &LayerOpts) -> Result<TarCas<W>> {
    let mut cas = cas;
    if !opts.import_manifests.is_empty() || opts.import_collection.is_some() {
        let mut importer = contentmanifest::MultiImporter::new(
            opts.hash,
            opts.import_manifests.iter().cloned(),
            opts.import_collection.as_deref(),
        )?;
        cas.import(&mut importer)?;
    }

    let mut rec = Recorder::new(cas);
    if let Some(metadata) = &opts.metadata {
        let data = std::fs::read(metadata)
            .with_context(|| format!("Reading metadata overrides {metadata}"))?;
        let provider: StaticMetadata = serde_json::from_slice(&data)
            .with_context(|| format!("Parsing metadata overrides {metadata}"))?;
        rec = rec.with_metadata(Box::new(provider));
    }
    for spec in &opts.known_digests {
        let mut parts = spec.splitn(3, '=');
        let (host, digest, size) = (parts.next(), parts.next(), parts.next());
        let (Some(host), Some(digest), Some(size)) = (host, digest, size) else {
            anyhow::bail!("Invalid --known-digest {spec}; expected HOST=DIGEST=SIZE");
        };
        let digest: HashValue = digest.parse()?;
        let size: u64 = size.parse().context("Parsing --known-digest size")?;
        rec.register_known_digest(host.into(), digest, size);
    }

    for import in &opts.imports {
        let f = File::open(import).with_context(|| format!("Opening {import}"))?;
        rec.import_tar(f)
            .with_context(|| format!("Importing {import}"))?;
    }
    if let Some(path) = &opts.file_manifest {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Reading file manifest {path}"))?;
        for entry in recorder::parse_file_manifest(&data)? {
            match entry.kind {
                recorder::EntryType::File => {
                    rec.add_file(&entry.path_in_image, &entry.host)?
                }
                recorder::EntryType::Directory => {
                    rec.add_tree(&entry.path_in_image, &entry.host)?
                }
            }
        }
    }
    if let Some(path) = &opts.symlink_manifest {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Reading symlink manifest {path}"))?;
        for (link, target) in recorder::parse_symlink_manifest(&data)? {
            rec.add_symlink(&link, &target)?;
        }
    }
    Ok(rec.into_cas())
}

fn write_layer_outputs(
    opts: &LayerOpts,
    state: &AppenderState,
    annotations: std::collections::BTreeMap<String, String>,
    content_manifest: &contentmanifest::Writer,
) -> Result<()> {
    if let Some(path) = &opts.content_manifest_out {
        let mut out = BufWriter::new(
            File::create(path).with_context(|| format!("Creating {path}"))?,
        );
        content_manifest.write_to(&mut out)?;
        out.flush()?;
    }
    if let Some(path) = &opts.metadata_out {
        write_json(
            path,
            &BlobMetadata {
                media_type: opts.compress.layer_media_type().to_string(),
                digest: state.outer_digest.to_string(),
                size: state.compressed_size,
                diff_id: Some(state.content_digest.to_string()),
                annotations,
            },
        )?;
    }
    Ok(())
}

#[context("Assembling layer")]
fn run_layer(opts: LayerOpts) -> Result<()> {
    let mode = parse_structural_mode(&opts.structure)?;
    let out = BufWriter::new(
        File::create(&opts.output).with_context(|| format!("Creating {}", opts.output))?,
    );
    let mut content_manifest = contentmanifest::Writer::new(opts.hash);

    if opts.estargz {
        let seekable = SeekableWriter::new(opts.hash, opts.compress, out)?;
        let mut cas = assemble_layer(TarCas::new(seekable, opts.hash, mode), &opts)?;
        cas.export(&mut content_manifest)?;
        cas.close()?;
        let seekable = cas.into_inner()?;
        let (state, output, mut sink) = seekable.finalize()?;
        sink.flush()?;
        if let Some(path) = &opts.zinfo_out {
            std::fs::write(path, output.zinfo.encode())
                .with_context(|| format!("Writing {path}"))?;
        }
        let annotations = output.annotations.into_iter().collect();
        write_layer_outputs(&opts, &state, annotations, &content_manifest)
    } else {
        let appender = Appender::new(opts.hash, opts.compress, out)?;
        let mut cas = assemble_layer(TarCas::new(appender, opts.hash, mode), &opts)?;
        cas.export(&mut content_manifest)?;
        cas.close()?;
        let appender = cas.into_inner()?;
        let (state, mut sink) = appender.finalize()?;
        sink.flush()?;
        write_layer_outputs(&opts, &state, Default::default(), &content_manifest)
    }
}

#[context("Describing blob")]
fn run_layer_metadata(opts: LayerMetadataOpts) -> Result<()> {
    let mut f = File::open(&opts.blob).with_context(|| format!("Opening {}", opts.blob))?;
    let mut hasher = opts.hash.new_hasher();
    let size = std::io::copy(&mut f, &mut hasher)?;
    let digest = hasher.finalize();

    let diff_id = if opts.diff_id {
        let f = File::open(&opts.blob)?;
        let mut reader = crate::recorder::decompress_reader(f)?;
        let mut hasher = opts.hash.new_hasher();
        std::io::copy(&mut reader, &mut hasher)?;
        Some(hasher.finalize().to_string())
    } else {
        None
    };

    write_json(
        &opts.output,
        &BlobMetadata {
            media_type: opts.media_type,
            digest: digest.to_string(),
            size,
            diff_id,
            annotations: Default::default(),
        },
    )
}

#[context("Building manifest")]
fn run_manifest(opts: ManifestOpts) -> Result<()> {
    let mut config: ImageConfiguration = match &opts.base_config {
        Some(path) => {
            let data =
                std::fs::read(path).with_context(|| format!("Reading config {path}"))?;
            serde_json::from_slice(&data).with_context(|| format!("Parsing config {path}"))?
        }
        None => oci_spec::image::ImageConfigurationBuilder::default()
            .build()
            .context("Building empty config")?,
    };
    if let Some(os) = &opts.os {
        config.set_os(Os::from(os.as_str()));
    }
    if let Some(arch) = &opts.arch {
        config.set_architecture(Arch::from(arch.as_str()));
    }

    let mut diff_ids: Vec<String> = config.rootfs().diff_ids().clone();
    let mut layer_descriptors: Vec<Descriptor> = Vec::new();
    for path in &opts.layers {
        let metadata = BlobMetadata::from_file(path)?;
        let diff_id = metadata
            .diff_id
            .clone()
            .with_context(|| format!("Layer metadata {path} carries no DiffID"))?;
        diff_ids.push(diff_id);
        layer_descriptors.push(metadata.to_descriptor()?);
    }
    let rootfs = RootFsBuilder::default()
        .typ("layers")
        .diff_ids(diff_ids)
        .build()
        .context("Building rootfs")?;
    config.set_rootfs(rootfs);

    let config_json = serde_json::to_vec(&config)?;
    std::fs::write(&opts.config_out, &config_json)
        .with_context(|| format!("Writing {}", opts.config_out))?;
    let config_descriptor = crate::oci::descriptor(
        MediaType::ImageConfig,
        config_json.len() as u64,
        &HashAlgorithm::Sha256.digest(&config_json),
    )?;

    let manifest = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(config_descriptor)
        .layers(layer_descriptors)
        .build()
        .context("Building manifest")?;
    let manifest_json = serde_json::to_vec(&manifest)?;
    std::fs::write(&opts.output, &manifest_json)
        .with_context(|| format!("Writing {}", opts.output))?;

    if let Some(path) = &opts.metadata_out {
        write_json(
            path,
            &BlobMetadata {
                media_type: MediaType::ImageManifest.to_string(),
                digest: HashAlgorithm::Sha256.digest(&manifest_json).to_string(),
                size: manifest_json.len() as u64,
                diff_id: None,
                annotations: Default::default(),
            },
        )?;
    }
    Ok(())
}

#[context("Building index")]
fn run_index(opts: IndexOpts) -> Result<()> {
    anyhow::ensure!(
        opts.platforms.is_empty() || opts.platforms.len() == opts.manifests.len(),
        "--platform count must match --manifest count"
    );
    let mut descriptors = Vec::new();
    for (i, path) in opts.manifests.iter().enumerate() {
        let metadata = BlobMetadata::from_file(path)?;
        let mut descriptor = metadata.to_descriptor()?;
        if let Some(platform) = opts.platforms.get(i) {
            let spec: crate::load::platform::PlatformSpec = platform.parse()?;
            let mut builder = PlatformBuilder::default()
                .os(Os::from(spec.os.as_str()))
                .architecture(Arch::from(spec.arch.as_str()));
            if let Some(variant) = &spec.variant {
                builder = builder.variant(variant.clone());
            }
            descriptor.set_platform(Some(builder.build().context("Building platform")?));
        }
        descriptors.push(descriptor);
    }
    let index = ImageIndexBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageIndex)
        .manifests(descriptors)
        .build()
        .context("Building index")?;
    let index_json = serde_json::to_vec(&index)?;
    std::fs::write(&opts.output, &index_json)
        .with_context(|| format!("Writing {}", opts.output))?;
    if let Some(path) = &opts.metadata_out {
        write_json(
            path,
            &BlobMetadata {
                media_type: MediaType::ImageIndex.to_string(),
                digest: HashAlgorithm::Sha256.digest(&index_json).to_string(),
                size: index_json.len() as u64,
                diff_id: None,
                annotations: Default::default(),
            },
        )?;
    }
    Ok(())
}

fn parse_blob_specs(specs: &[String]) -> Result<Vec<(HashValue, Utf8PathBuf)>> {
    specs
        .iter()
        .map(|spec| {
            let (digest, path) = spec
                .split_once('=')
                .with_context(|| format!("Invalid --blob {spec}; expected DIGEST=PATH"))?;
            Ok((digest.parse()?, path.into()))
        })
        .collect()
}

#[context("Assembling OCI layout")]
fn run_oci_layout(opts: OciLayoutOpts) -> Result<()> {
    let index_json =
        std::fs::read(&opts.index).with_context(|| format!("Reading {}", opts.index))?;
    let blobs = parse_blob_specs(&opts.blobs)?;
    match (&opts.output, &opts.tar) {
        (Some(output), None) => {
            let layout = crate::ocilayout::OciLayout::ensure(output)?;
            for (digest, path) in &blobs {
                layout.put_blob_from_file(digest, path)?;
            }
            layout.write_index(&index_json)
        }
        (None, Some(tar_path)) => {
            let out = BufWriter::new(
                File::create(tar_path).with_context(|| format!("Creating {tar_path}"))?,
            );
            let mut layout = crate::ocilayout::OciLayoutTar::new(out, &index_json)?;
            for (digest, path) in &blobs {
                let data =
                    std::fs::read(path).with_context(|| format!("Reading {path}"))?;
                layout.put_blob(digest, &data)?;
            }
            layout.finish()?.flush()?;
            Ok(())
        }
        _ => anyhow::bail!("Exactly one of --output or --tar is required"),
    }
}

#[context("Compressing")]
fn run_compress(opts: CompressOpts) -> Result<()> {
    let state_in = opts
        .state_in
        .as_ref()
        .map(|path| -> Result<AppenderState> {
            let data =
                std::fs::read(path).with_context(|| format!("Reading state {path}"))?;
            Ok(AppenderState::decode(&data)?)
        })
        .transpose()?;

    let mut open = std::fs::OpenOptions::new();
    open.create(true).write(true);
    if state_in.is_some() {
        open.append(true);
    } else {
        open.truncate(true);
    }
    let out = BufWriter::new(
        open.open(&opts.output)
            .with_context(|| format!("Opening {}", opts.output))?,
    );

    let mut appender = match &state_in {
        Some(state) => Appender::resume(state, opts.hash, opts.compress, out)?,
        None => Appender::new(opts.hash, opts.compress, out)?,
    };
    let mut input =
        File::open(&opts.input).with_context(|| format!("Opening {}", opts.input))?;
    std::io::copy(&mut input, &mut appender).context("Compressing input")?;
    let (state, mut sink) = appender.finalize()?;
    sink.flush()?;

    if let Some(path) = &opts.state_out {
        std::fs::write(path, state.encode()).with_context(|| format!("Writing {path}"))?;
    }
    if let Some(path) = &opts.metadata_out {
        write_json(
            path,
            &BlobMetadata {
                media_type: opts.compress.layer_media_type().to_string(),
                digest: state.outer_digest.to_string(),
                size: state.compressed_size,
                diff_id: Some(state.content_digest.to_string()),
                annotations: Default::default(),
            },
        )?;
    }
    Ok(())
}

#[context("Validating blob")]
fn run_validate(opts: ValidateOpts) -> Result<()> {
    let metadata = BlobMetadata::from_file(&opts.metadata)?;
    let expected: HashValue = metadata.digest.parse()?;
    let mut f = File::open(&opts.blob).with_context(|| format!("Opening {}", opts.blob))?;
    let mut hasher = expected.algorithm().new_hasher();
    let size = std::io::copy(&mut f, &mut hasher)?;
    anyhow::ensure!(
        size == metadata.size,
        "{} is {size} bytes; metadata says {}",
        opts.blob,
        metadata.size
    );
    let actual = hasher.finalize();
    anyhow::ensure!(
        actual == expected,
        "{} hashes to {actual}; metadata says {expected}",
        opts.blob
    );
    Ok(())
}

async fn run_push(opts: PushOpts) -> Result<()> {
    let manifest = DeployManifest::from_file(&opts.deploy_manifest)?;
    crate::dispatch::execute_deploy(&manifest, &opts.root, opts.jobs, opts.allow_missing).await
}

fn parse_strategy(s: &str) -> Result<crate::deploy::DeployStrategy> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .with_context(|| format!("Unknown strategy {s}"))
}

#[context("Assembling deploy metadata")]
fn run_deploy_metadata(opts: DeployMetadataOpts) -> Result<()> {
    let mut operations = Vec::new();
    for path in &opts.operations {
        let data =
            std::fs::read(path).with_context(|| format!("Reading operation {path}"))?;
        operations.push(
            serde_json::from_slice(&data)
                .with_context(|| format!("Parsing operation {path}"))?,
        );
    }
    let manifest = DeployManifest {
        operations,
        settings: crate::deploy::Settings {
            push_strategy: parse_strategy(&opts.push_strategy)?,
            load_strategy: parse_strategy(&opts.load_strategy)?,
        },
    };
    write_json(&opts.output, &manifest)
}

#[context("Merging deploy manifests")]
fn run_deploy_merge(opts: DeployMergeOpts) -> Result<()> {
    let manifests = opts
        .inputs
        .iter()
        .map(|path| DeployManifest::from_file(path))
        .collect::<Result<Vec<_>>>()?;
    let merged = DeployManifest::merge(manifests)?;
    write_json(&opts.output, &merged)
}

async fn run_docker_save(opts: DockerSaveOpts) -> Result<()> {
    use crate::deploy::Operation;

    let manifest = DeployManifest::from_file(&opts.deploy_manifest)?;
    let registry = std::sync::Arc::new(RegistryClient::new());
    let vfs = crate::deploy::vfs::DeployVfs::new(&manifest, &opts.root, registry, None, false)?;
    let op = manifest
        .operations
        .iter()
        .find_map(|op| match op {
            Operation::Load(load) => Some(load),
            Operation::Push(_) => None,
        })
        .context("Deploy manifest has no load operation to save")?;

    let platforms = match &opts.platform {
        Some(platform) => vec![platform.parse()?],
        None => crate::load::platform::default_platforms()?,
    };
    let image_manifest: ImageManifest = {
        use crate::deploy::RootKind;
        let root_digest = op.root.descriptor.digest().to_string();
        match op.root.kind {
            RootKind::Manifest => vfs.image(&root_digest).await?,
            RootKind::Index => {
                let index = vfs.image_index(&root_digest).await?;
                let selected = crate::load::platform::select_manifest(&index, &platforms)?;
                vfs.image(&selected.digest().to_string()).await?
            }
        }
    };
    let reference = {
        let mut r: crate::oci::Reference = op.reference.parse()?;
        if r.tag.is_none() && r.digest.is_none() {
            r.tag = Some(crate::oci::Reference::DEFAULT_TAG.to_string());
        }
        r.normalized_name()
    };
    let image = crate::load::docker::SaveImage::fetch(&vfs, reference, image_manifest).await?;

    if opts.output == "-" {
        image.write_tar(std::io::stdout().lock())
    } else {
        let out = BufWriter::new(
            File::create(&opts.output)
                .with_context(|| format!("Creating {}", opts.output))?,
        );
        image.write_tar(out)
    }
}

async fn run_download_blob(opts: DownloadBlobOpts) -> Result<()> {
    let client = RegistryClient::new();
    let mut reader = client
        .blob_reader(&opts.registry, &opts.repository, &opts.digest)
        .await?;
    let mut out = tokio::fs::File::create(&opts.output)
        .await
        .with_context(|| format!("Creating {}", opts.output))?;
    tokio::io::copy(&mut reader, &mut out)
        .await
        .with_context(|| format!("Downloading {}", opts.digest))?;
    use tokio::io::AsyncWriteExt;
    out.flush().await?;
    Ok(())
}

#[context("Expanding template")]
fn run_expand_template(opts: ExpandTemplateOpts) -> Result<()> {
    let mut content = std::fs::read_to_string(&opts.template)
        .with_context(|| format!("Reading template {}", opts.template))?;
    let mut apply = |key: &str, value: &str| {
        content = content.replace(&format!("{{{{{key}}}}}"), value);
    };
    for spec in &opts.set {
        let (key, value) = spec
            .split_once('=')
            .with_context(|| format!("Invalid --set {spec}; expected KEY=VALUE"))?;
        apply(key, value);
    }
    for spec in &opts.set_from_env {
        let (key, var) = spec
            .split_once('=')
            .with_context(|| format!("Invalid --set-from-env {spec}; expected KEY=VAR"))?;
        let value = std::env::var(var)
            .with_context(|| format!("Environment variable {var} is not set"))?;
        apply(key, &value);
    }
    std::fs::write(&opts.output, content)
        .with_context(|| format!("Writing {}", opts.output))
}

/// Parse the process arguments and run the selected subcommand. When a
/// `dispatch.json` is present next to the binary, its deploy manifest
/// runs instead and argv is ignored.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<std::ffi::OsString> + Clone,
{
    if let Some(result) = crate::dispatch::try_dispatch().await {
        return result;
    }
    match Opt::parse_from(args) {
        Opt::Layer(opts) => run_layer(opts),
        Opt::LayerMetadata(opts) => run_layer_metadata(opts),
        Opt::Manifest(opts) => run_manifest(opts),
        Opt::Index(opts) => run_index(opts),
        Opt::OciLayout(opts) => run_oci_layout(opts),
        Opt::Compress(opts) => run_compress(opts),
        Opt::Validate(opts) => run_validate(opts),
        Opt::Push(opts) => run_push(opts).await,
        Opt::DeployMetadata(opts) => run_deploy_metadata(opts),
        Opt::DeployMerge(opts) => run_deploy_merge(opts),
        Opt::DockerSave(opts) => run_docker_save(opts).await,
        Opt::DownloadBlob(opts) => run_download_blob(opts).await,
        Opt::ExpandTemplate(opts) => run_expand_template(opts),
    }
}
