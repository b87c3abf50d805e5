use fwdelta_core::{ChangeKind, LineCount};
use fwdelta_difflens::parser::parse_summary;
use fwdelta_difflens::tree::{ChangeTree, RENAMED_KEY};

#[test]
fn arrow_rename_reaches_tree_and_side_table() {
    let parsed = parse_summary("0\t5\told/path/App.apk => new/path/App.apk\n");
    assert!(parsed.skipped.is_empty());

    let mut tree = ChangeTree::new();
    for record in &parsed.records {
        tree.insert(record);
    }
    tree.aggregate();

    let leaf = tree.leaf("new/path/App.apk").unwrap();
    assert_eq!(leaf.status, ChangeKind::Renamed);
    assert_eq!(leaf.deleted, LineCount::Lines(5));
    assert!(tree.get("old/path/App.apk").is_none());

    let json = serde_json::to_value(&tree).unwrap();
    assert_eq!(json[RENAMED_KEY]["new/path/App.apk"]["old_path"], "old/path/App.apk");
    assert_eq!(json["new"]["path"]["deleted"], 5);
}

#[test]
fn mixed_summary_aggregates_per_directory() {
    let input = "\
12\t4\tsystem/etc/init/hw/init.rc
-\t-\tsystem/lib64/libkeystore.so
0\t30\tsystem/bin/oldtool => /dev/null
7\t0\t/dev/null => system/bin/newtool
2\t2\tsystem/{app => priv-app}/Foo/Foo.apk
not a record
";
    let parsed = parse_summary(input);
    assert_eq!(parsed.records.len(), 5);
    assert_eq!(parsed.skipped.len(), 1);
    assert_eq!(parsed.skipped[0].line_number, 6);

    let mut tree = ChangeTree::new();
    for record in &parsed.records {
        tree.insert(record);
    }
    assert_eq!(tree.aggregate(), (21, 36));
    assert_eq!(tree.dir("system/bin").unwrap().totals(), (7, 30));
    assert_eq!(tree.dir("system/lib64").unwrap().totals(), (0, 0));
    assert_eq!(
        tree.leaf("system/bin/oldtool").unwrap().status,
        ChangeKind::Deleted
    );
    assert_eq!(tree.renamed().len(), 1);
    assert!(tree.renamed().contains_key("system/priv-app/Foo/Foo.apk"));
}
