use adapt_hash::DictTable;
use adapt_hash::Key;

fn print_stats(label: &str, table: &DictTable<u64>) {
    let stats = table.stats();
    println!("=== {label} ===");
    println!(
        "Entries: {}/{} index slots ({:.2}% load factor)",
        stats.len,
        stats.index_capacity,
        stats.load_factor * 100.0
    );
    println!(
        "Bucket list: {} slots, {} tombstones",
        stats.bucket_slots, stats.tombstones
    );
    println!(
        "Hashing: {}",
        match stats.homogeneous {
            None => "unspecialized (no keys observed)",
            Some(true) => "specialized (homogeneous keys)",
            Some(false) => "generic (heterogeneous keys)",
        }
    );
    println!();
}

fn main() {
    let table: DictTable<u64> = DictTable::with_capacity(1000);
    print_stats("empty, pre-sized for 1000", &table);

    for k in 0..1000u64 {
        table.add(Key::from(k as i64), k);
    }
    print_stats("filled with 1000 int keys", &table);

    for k in (0..1000u64).step_by(2) {
        table.remove(&Key::from(k as i64));
    }
    print_stats("removed every second key", &table);

    for k in 0..500u64 {
        table.add(Key::from(format!("s{k}")), k);
    }
    print_stats("added 500 string keys (generic switch)", &table);

    table.clear();
    print_stats("cleared (specialization retained)", &table);
}
