use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bootpack::boot::kexec::DryRunLoader;
use bootpack::boot::OsImage;
use bootpack::config::load_manifest;
use bootpack::cpio::content::ContentReader;
use bootpack::cpio::{
    for_each_record, make_all_reproducible, newc, write_records_and_dirs, write_trailer, Content,
    DedupWriter, EofReader, FormatRegistry, ReadAt, Recorder, RecordReader, UnixFiler,
};
use bootpack::package::{
    Package, PackageRegistry, RsaSigner, RsaVerifier, Signer, SigningWriter, Verifier,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const ARCHIVE_FORMAT: &str = "newc";

fn usage() -> &'static str {
    "Usage:\n  bootpack [-v] pack <manifest.toml> <output>\n  bootpack [-v] unpack <package> <dir> [public_key.pem]\n  bootpack [-v] boot <package> [public_key.pem]\n  bootpack [-v] list <archive>\n  bootpack [-v] extract <archive> <dir>\n  bootpack [-v] record <source_dir> <output> [private_key.pem]"
}

fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let verbose = matches!(args.first().map(String::as_str), Some("-v" | "--verbose"));
    if verbose {
        args.remove(0);
    }
    init_logging(verbose)?;

    match args.as_slice() {
        [cmd, manifest, output] if cmd == "pack" => pack(Path::new(manifest), Path::new(output)),
        [cmd, package, dir] if cmd == "unpack" => unpack(Path::new(package), Path::new(dir), None),
        [cmd, package, dir, key] if cmd == "unpack" => {
            unpack(Path::new(package), Path::new(dir), Some(Path::new(key)))
        }
        [cmd, package] if cmd == "boot" => boot(Path::new(package), None),
        [cmd, package, key] if cmd == "boot" => boot(Path::new(package), Some(Path::new(key))),
        [cmd, archive] if cmd == "list" => list(Path::new(archive)),
        [cmd, archive, dir] if cmd == "extract" => extract(Path::new(archive), Path::new(dir)),
        [cmd, source, output] if cmd == "record" => {
            record(Path::new(source), Path::new(output), None)
        }
        [cmd, source, output, key] if cmd == "record" => {
            record(Path::new(source), Path::new(output), Some(Path::new(key)))
        }
        _ => bail!(usage()),
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .with_ansi(false)
        .with_writer(io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("installing log subscriber")
}

fn open_archive(path: &Path) -> Result<EofReader<Box<dyn RecordReader>>> {
    let file =
        File::open(path).with_context(|| format!("opening archive '{}'", path.display()))?;
    let format = FormatRegistry::with_defaults().lookup(ARCHIVE_FORMAT)?;
    let source: Content = Arc::new(file);
    Ok(EofReader::new(format.reader_at(source)))
}

fn create_archive(path: &Path) -> Result<newc::Writer<BufWriter<File>>> {
    let file =
        File::create(path).with_context(|| format!("creating archive '{}'", path.display()))?;
    Ok(newc::Writer::new(BufWriter::new(file)))
}

fn finish_archive(mut w: newc::Writer<BufWriter<File>>, path: &Path) -> Result<()> {
    write_trailer(&mut w)?;
    let bytes = w.position();
    w.into_inner()
        .flush()
        .with_context(|| format!("flushing archive '{}'", path.display()))?;
    info!(path = %path.display(), bytes, "wrote archive");
    Ok(())
}

fn load_verifier(key: Option<&Path>) -> Result<Option<RsaVerifier>> {
    key.map(|path| {
        RsaVerifier::load(path)
            .with_context(|| format!("loading public key '{}'", path.display()))
    })
    .transpose()
}

fn read_package(path: &Path, key: Option<&Path>) -> Result<Package> {
    let verifier = load_verifier(key)?;
    let mut reader = open_archive(path)?;
    let mut package = Package::default();
    package
        .unpack(
            &mut reader,
            verifier.as_ref().map(|v| v as &dyn Verifier),
            &PackageRegistry::with_defaults(),
        )
        .with_context(|| format!("unpacking boot package '{}'", path.display()))?;
    Ok(package)
}

fn pack(manifest_path: &Path, output: &Path) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    let package = manifest.build_package()?;
    let signer = manifest.signer()?;

    let mut w = create_archive(output)?;
    package
        .pack(&mut w, signer.as_ref().map(|s| s as &dyn Signer))
        .with_context(|| format!("packing '{}'", manifest_path.display()))?;
    finish_archive(w, output)
}

fn unpack(package_path: &Path, dir: &Path, key: Option<&Path>) -> Result<()> {
    let package = read_package(package_path, key)?;
    let Some(linux) = package.image.as_ref().and_then(|img| img.as_linux()) else {
        bail!("'{}' does not hold a Linux image", package_path.display());
    };

    fs::create_dir_all(dir).with_context(|| format!("creating '{}'", dir.display()))?;
    if let Some(kernel) = &linux.kernel {
        write_content(kernel, &dir.join("kernel"))?;
    }
    if let Some(initrd) = &linux.initrd {
        write_content(initrd, &dir.join("initrd"))?;
    }
    fs::write(dir.join("cmdline"), &linux.cmdline)
        .with_context(|| format!("writing cmdline into '{}'", dir.display()))?;

    println!("{}", serde_json::to_string_pretty(&package.metadata)?);
    Ok(())
}

fn write_content(content: &Content, path: &Path) -> Result<()> {
    let mut out = File::create(path).with_context(|| format!("creating '{}'", path.display()))?;
    let mut reader = ContentReader::new(content.as_ref(), content.size()?);
    io::copy(&mut reader, &mut out).with_context(|| format!("writing '{}'", path.display()))?;
    Ok(())
}

fn boot(package_path: &Path, key: Option<&Path>) -> Result<()> {
    let package = read_package(package_path, key)?;
    let Some(image) = &package.image else {
        bail!("'{}' holds no image", package_path.display());
    };
    image.execution_info()?;
    image.execute(&mut DryRunLoader)?;
    Ok(())
}

fn list(archive: &Path) -> Result<()> {
    let mut reader = open_archive(archive)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for_each_record(&mut reader, |rec| {
        writeln!(out, "{}", rec.long_listing())?;
        Ok(())
    })?;
    Ok(())
}

fn extract(archive: &Path, dir: &Path) -> Result<()> {
    let mut reader = open_archive(archive)?;
    let mut filer = UnixFiler::new(dir, false);
    for_each_record(&mut reader, |rec| filer.create(&rec))
        .with_context(|| format!("extracting '{}'", archive.display()))?;
    filer
        .finish()
        .with_context(|| format!("applying directory modes under '{}'", dir.display()))?;
    Ok(())
}

fn record(source: &Path, output: &Path, key: Option<&Path>) -> Result<()> {
    let records = Recorder::new()
        .record_tree(source)
        .with_context(|| format!("recording '{}'", source.display()))?;
    let count = records.len();
    let records = make_all_reproducible(records);

    let mut w = create_archive(output)?;
    match key {
        Some(path) => {
            let signer = RsaSigner::load(path)
                .with_context(|| format!("loading private key '{}'", path.display()))?;
            let mut dedup = DedupWriter::new(SigningWriter::new(&mut w));
            write_records_and_dirs(&mut dedup, records)?;
            dedup.into_inner().write_signature(&signer)?;
        }
        None => {
            let mut dedup = DedupWriter::new(&mut w);
            write_records_and_dirs(&mut dedup, records)?;
        }
    }
    info!(source = %source.display(), records = count, "recorded tree");
    finish_archive(w, output)
}
