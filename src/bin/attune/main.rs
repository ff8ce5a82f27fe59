//! Command-line front-end: maintains a collection file of analyzed
//! tracks and answers similarity queries over it.

mod collection;

use anyhow::{anyhow, bail, Context, Result};
use attune_audio::{find_min, Jukebox, Track, TrackId};
use clap::Parser;
use collection::CollectionFile;
use log::info;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Excerpt passed to the decoder when analyzing collection files:
/// 30 seconds, centered but starting no later than 48 seconds in.
const EXCERPT_LENGTH: f32 = 30.;
const EXCERPT_START: f32 = -48.;

#[derive(Parser)]
#[command(
    name = "attune",
    version,
    about = "Content-based music similarity over a track collection"
)]
struct Cli {
    /// Collection file to operate on
    #[arg(short = 'c', value_name = "FILE", default_value = "collection.musly")]
    collection: PathBuf,

    /// Initialize a new collection with the given similarity method
    #[arg(short = 'n', value_name = "METHOD")]
    init: Option<String>,

    /// Initialize a new collection with the default method
    #[arg(short = 'N', conflicts_with = "init")]
    init_default: bool,

    /// Analyze audio files under PATH and append them to the collection
    #[arg(short = 'a', value_name = "PATH")]
    add: Option<PathBuf>,

    /// Only consider files with this extension while scanning
    #[arg(short = 'x', value_name = "EXT")]
    extension: Option<String>,

    /// Print the k nearest collection tracks to FILE
    #[arg(short = 'p', value_name = "FILE")]
    playlist: Option<String>,

    /// k-NN genre evaluation; the genre is path component POS
    #[arg(short = 'e', value_name = "POS")]
    evaluate: Option<usize>,

    /// k-NN genre evaluation with the genre position auto-detected
    #[arg(short = 'E', conflicts_with = "evaluate")]
    evaluate_auto: bool,

    /// Exclude same-artist neighbors; the artist is path component POS
    #[arg(short = 'f', value_name = "POS")]
    artist: Option<usize>,

    /// Number of nearest neighbors for -p, -e and -s
    #[arg(short = 'k', value_name = "K", default_value_t = 5)]
    neighbors: usize,

    /// Write a full MIREX similarity matrix to OUT
    #[arg(short = 'm', value_name = "OUT")]
    mirex_full: Option<PathBuf>,

    /// Write a k-sparse MIREX similarity matrix to OUT
    #[arg(short = 's', value_name = "OUT")]
    mirex_sparse: Option<PathBuf>,

    /// List the collection's records
    #[arg(short = 'l')]
    list: bool,

    /// Dump the collection's feature blocks as text
    #[arg(short = 'd')]
    dump: bool,

    /// Keep jukebox state in FILE across invocations
    #[arg(short = 'j', value_name = "FILE")]
    jukebox_file: Option<PathBuf>,

    /// Keep jukebox state in <collection>.jbox
    #[arg(short = 'J', conflicts_with = "jukebox_file")]
    jukebox_auto: bool,

    /// Print version, methods and decoders
    #[arg(short = 'i')]
    info: bool,

    /// Verbosity (0 quiet .. 5 trace)
    #[arg(short = 'v', value_name = "LEVEL", default_value_t = 0)]
    verbosity: u8,
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbosity {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("attune: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.info {
        println!("Version: {}", attune_audio::version());
        println!("Available similarity methods: {}", attune_audio::list_methods());
        println!("Available audio decoders: {}", attune_audio::list_decoders());
        return Ok(());
    }

    let collection = CollectionFile::new(&cli.collection);

    if cli.init.is_some() || cli.init_default {
        let method = cli.init.as_deref().unwrap_or("");
        let jukebox = Jukebox::power_on(Some(method), None)?;
        collection.initialize(jukebox.method_name())?;
        println!("Initialized collection: {}", cli.collection.display());
        println!("Similarity method: {}", jukebox.method_name());
        println!("~~~");
        println!("{}", jukebox.about_method());
        println!("~~~");
        return Ok(());
    }

    if let Some(path) = &cli.add {
        return add_files(&collection, path, cli.extension.as_deref());
    }

    if cli.list || cli.dump {
        let mut reader = collection.open()?;
        let jukebox = Jukebox::power_on(Some(reader.method()), None)?;
        for (index, (path, payload)) in reader.by_ref().enumerate() {
            if cli.list {
                println!(
                    "track-id: {index}, track-size: {} bytes, track-origin: {path}",
                    payload.len()
                );
            } else {
                let mut track = jukebox.track_alloc();
                jukebox.track_frombin(&payload, &mut track)?;
                println!("{path}");
                println!("{}", jukebox.track_tostr(&track));
            }
        }
        return Ok(());
    }

    // the remaining actions need the whole collection in memory
    let (mut jukebox, paths, tracks) = load_tracks(&collection)?;
    if tracks.is_empty() {
        bail!("collection {} holds no tracks", cli.collection.display());
    }

    let state_file = if cli.jukebox_auto {
        let mut path = cli.collection.clone();
        path.set_extension("jbox");
        Some(path)
    } else {
        cli.jukebox_file.clone()
    };
    let ids = register_tracks(&mut jukebox, &tracks, state_file.as_deref())?;

    if let Some(seed_path) = &cli.playlist {
        return playlist(&jukebox, &paths, &tracks, &ids, seed_path, cli.neighbors);
    }
    if cli.evaluate.is_some() || cli.evaluate_auto {
        return evaluate(
            &jukebox,
            &paths,
            &tracks,
            &ids,
            cli.evaluate,
            cli.artist,
            cli.neighbors,
        );
    }
    if let Some(out) = &cli.mirex_full {
        return write_mirex(&jukebox, &paths, &tracks, &ids, out, None);
    }
    if let Some(out) = &cli.mirex_sparse {
        return write_mirex(&jukebox, &paths, &tracks, &ids, out, Some(cli.neighbors));
    }

    bail!("no action given, try '--help'");
}

/// Walk `root`, analyze every audio file not yet in the collection
/// and append it. Files that fail to decode or analyze are reported
/// and skipped.
fn add_files(collection: &CollectionFile, root: &Path, extension: Option<&str>) -> Result<()> {
    let reader = collection.open()?;
    let method = reader.method().to_string();
    let known: HashMap<String, ()> = reader.map(|(path, _)| (path, ())).collect();
    let jukebox = Jukebox::power_on(Some(&method), None)?;
    info!("read {} tracks from the collection", known.len());

    let mut files: Vec<PathBuf> = if root.is_file() {
        vec![root.to_path_buf()]
    } else {
        WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| match extension {
                Some(ext) => path
                    .extension()
                    .map(|e| e.eq_ignore_ascii_case(ext))
                    .unwrap_or(false),
                None => true,
            })
            .collect()
    };
    files.sort();

    if files.is_empty() {
        println!("No files found while scanning: {}", root.display());
        return Ok(());
    }

    let mut buffer = vec![0u8; jukebox.track_binsize()];
    let mut track = jukebox.track_alloc();
    for (count, file) in files.iter().enumerate() {
        let name = file.to_string_lossy().to_string();
        if known.contains_key(&name) {
            println!("Skipping file #{}, already in collection: {name}", count + 1);
            continue;
        }
        println!("Analyzing file #{}: {name}", count + 1);
        match jukebox.analyze_audiofile(file, EXCERPT_LENGTH, EXCERPT_START, &mut track) {
            Ok(()) => {
                let written = jukebox.track_tobin(&track, &mut buffer)?;
                collection.append_track(&name, &buffer[..written])?;
            }
            Err(e) => {
                println!("Analysis failed: {e}");
            }
        }
    }
    Ok(())
}

/// Read every record of the collection into memory.
fn load_tracks(collection: &CollectionFile) -> Result<(Jukebox, Vec<String>, Vec<Track>)> {
    let reader = collection.open()?;
    let method = reader.method().to_string();
    let jukebox = Jukebox::power_on(Some(&method), None)?;

    let mut paths = Vec::new();
    let mut tracks = Vec::new();
    for (path, payload) in reader {
        let mut track = jukebox.track_alloc();
        jukebox
            .track_frombin(&payload, &mut track)
            .with_context(|| format!("record for {path}"))?;
        paths.push(path);
        tracks.push(track);
    }
    info!("loaded {} tracks to memory", tracks.len());
    Ok((jukebox, paths, tracks))
}

/// Register all tracks with the jukebox, reusing serialized state
/// when it matches the collection (same method, same count, ids
/// 0..n-1 in collection order).
fn register_tracks(
    jukebox: &mut Jukebox,
    tracks: &[Track],
    state_file: Option<&Path>,
) -> Result<Vec<TrackId>> {
    if let Some(state) = state_file {
        if state.exists() {
            match Jukebox::from_file(state) {
                Ok(restored)
                    if restored.method_name() == jukebox.method_name()
                        && restored.track_count() == tracks.len()
                        && restored.max_track_id() == tracks.len() as TrackId - 1 =>
                {
                    info!("reusing jukebox state from {}", state.display());
                    *jukebox = restored;
                    return Ok((0..tracks.len() as TrackId).collect());
                }
                Ok(_) => info!("jukebox state out of date, re-registering"),
                Err(e) => info!("could not load jukebox state: {e}"),
            }
        }
    }

    jukebox.set_music_style(tracks)?;
    let mut ids = vec![0; tracks.len()];
    jukebox.add_tracks(tracks, &mut ids, true)?;

    if let Some(state) = state_file {
        jukebox.to_file(state)?;
        info!("wrote jukebox state to {}", state.display());
    }
    Ok(ids)
}

/// Print the `k` nearest collection tracks to the given seed path.
fn playlist(
    jukebox: &Jukebox,
    paths: &[String],
    tracks: &[Track],
    ids: &[TrackId],
    seed_path: &str,
    k: usize,
) -> Result<()> {
    let seed = paths
        .iter()
        .position(|p| p == seed_path)
        .ok_or_else(|| anyhow!("{seed_path} is not in the collection"))?;

    let mut similarities = vec![0f32; tracks.len()];
    jukebox.similarity(&tracks[seed], ids[seed], tracks, ids, &mut similarities)?;
    // the seed itself always scores 0, skip it via k+1
    let nearest = find_min(&similarities, Some(ids), k + 1, true);
    for (_, id) in nearest.iter().filter(|(_, id)| *id != ids[seed]).take(k) {
        println!("{}", paths[*id as usize]);
    }
    Ok(())
}

/// Derive a per-track label from a path component: component `pos`
/// of the path, or, when `pos` is `None`, the first component past
/// the longest common prefix of all paths.
fn labels_from_paths(paths: &[String], pos: Option<usize>) -> (Vec<i32>, Vec<String>) {
    let (skip, pos) = match pos {
        Some(pos) => (0, pos),
        None => (longest_common_prefix(paths).len(), 0),
    };

    let mut names: Vec<String> = Vec::new();
    let mut index: HashMap<String, i32> = HashMap::new();
    let mut labels = Vec::with_capacity(paths.len());
    for path in paths {
        let component = path[skip.min(path.len())..]
            .split('/')
            .filter(|c| !c.is_empty())
            .nth(pos);
        match component {
            Some(name) => {
                let next = names.len() as i32;
                let id = *index.entry(name.to_string()).or_insert_with(|| {
                    names.push(name.to_string());
                    next
                });
                labels.push(id);
            }
            None => labels.push(-1),
        }
    }
    (labels, names)
}

fn longest_common_prefix(paths: &[String]) -> String {
    let mut prefix = paths.first().cloned().unwrap_or_default();
    for path in paths {
        while !path.starts_with(&prefix) {
            prefix.pop();
        }
    }
    prefix
}

/// k-NN genre classification over the collection; prints a confusion
/// matrix and the resulting accuracy.
fn evaluate(
    jukebox: &Jukebox,
    paths: &[String],
    tracks: &[Track],
    ids: &[TrackId],
    genre_pos: Option<usize>,
    artist_pos: Option<usize>,
    k: usize,
) -> Result<()> {
    if k >= tracks.len() {
        bail!("evaluation needs more tracks than neighbors");
    }
    let (genres, genre_names) = labels_from_paths(paths, genre_pos);
    let artists = artist_pos.map(|pos| labels_from_paths(paths, Some(pos)).0);
    let num_genres = genre_names.len() + 1; // trailing slot for "Unknown"

    println!("k-NN genre classification (k={k}), {} genres", genre_names.len());
    let mut confusion = vec![vec![0u32; num_genres]; num_genres];
    let mut similarities = vec![0f32; tracks.len()];
    for i in 0..tracks.len() {
        jukebox.similarity(&tracks[i], ids[i], tracks, ids, &mut similarities)?;

        // keep the seed and same-artist neighbors out of the vote
        similarities[i] = f32::INFINITY;
        if let Some(artists) = &artists {
            for (j, sim) in similarities.iter_mut().enumerate() {
                if j != i && artists[j] == artists[i] {
                    *sim = f32::INFINITY;
                }
            }
        }

        let mut votes = vec![0u32; num_genres];
        for (_, j) in find_min(&similarities, None, k, true) {
            let genre = genres[j as usize];
            let slot = if genre < 0 { num_genres - 1 } else { genre as usize };
            votes[slot] += 1;
        }
        let mut predicted = num_genres - 1;
        let mut best = 0;
        for (slot, &count) in votes.iter().enumerate() {
            if count > best {
                best = count;
                predicted = slot;
            }
        }

        let actual = if genres[i] < 0 {
            num_genres - 1
        } else {
            genres[i] as usize
        };
        confusion[actual][predicted] += 1;
    }

    println!("Genre confusion matrix:");
    for row in &confusion {
        let cells: Vec<String> = row.iter().map(|c| format!("{c:5}")).collect();
        println!("{}", cells.join(" "));
    }
    let correct: u32 = (0..num_genres).map(|i| confusion[i][i]).sum();
    let total: u32 = confusion.iter().flatten().sum();
    println!(
        "Correctly classified: {correct}/{total} ({:.1}%)",
        100. * correct as f32 / total as f32
    );
    Ok(())
}

/// Write a MIREX-style similarity matrix: full when `sparse_k` is
/// `None`, otherwise one `index:distance` pair per nearest neighbor.
fn write_mirex(
    jukebox: &Jukebox,
    paths: &[String],
    tracks: &[Track],
    ids: &[TrackId],
    out: &Path,
    sparse_k: Option<usize>,
) -> Result<()> {
    let file =
        File::create(out).with_context(|| format!("creating output file {}", out.display()))?;
    let mut writer = BufWriter::new(file);

    writeln!(
        writer,
        "Attune MIREX similarity matrix (Version: {}), Method: {}",
        attune_audio::version(),
        jukebox.method_name()
    )?;
    for (i, path) in paths.iter().enumerate() {
        writeln!(writer, "{}\t{path}", i + 1)?;
    }
    write!(writer, "Q/R")?;
    for i in 0..paths.len() {
        write!(writer, "\t{}", i + 1)?;
    }
    writeln!(writer)?;

    let mut similarities = vec![0f32; tracks.len()];
    for i in 0..tracks.len() {
        if jukebox
            .similarity(&tracks[i], ids[i], tracks, ids, &mut similarities)
            .is_err()
        {
            similarities.fill(f32::MAX);
        }
        write!(writer, "{}", i + 1)?;
        match sparse_k {
            None => {
                for sim in &similarities {
                    write!(writer, "\t{sim}")?;
                }
            }
            Some(k) => {
                for (sim, j) in find_min(&similarities, None, k + 1, true) {
                    if j as usize == i {
                        continue;
                    }
                    write!(writer, "\t{}:{sim}", j + 1)?;
                }
            }
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    println!("Wrote similarity matrix to {}", out.display());
    Ok(())
}
