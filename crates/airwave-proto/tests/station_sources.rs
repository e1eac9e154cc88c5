use airwave_proto::stations::{
    builtin_stations, load_stations_from_m3u, load_stations_from_toml,
    parse_stations_from_toml_str,
};

#[test]
fn toml_station_file_keeps_order_and_drops_duplicates() {
    let content = r#"
[[station]]
name = "Classic 105"
url = "https://atunwadigital.streamguys1.com/classic105"

[[station]]
name = "Capital FM"
url = " https://atunwadigital.streamguys1.com/capitalfm "

[[station]]
name = "Classic 105 (again)"
url = "https://atunwadigital.streamguys1.com/classic105"

[[station]]
name = "Broken"
url = ""
"#;
    let stations = parse_stations_from_toml_str(content).expect("valid TOML");
    let names: Vec<&str> = stations.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["Classic 105", "Capital FM"]);
    assert_eq!(
        stations[1].url,
        "https://atunwadigital.streamguys1.com/capitalfm"
    );
}

#[test]
fn empty_toml_yields_empty_table() {
    let stations = parse_stations_from_toml_str("").expect("empty file is valid");
    assert!(stations.is_empty());
}

#[test]
fn malformed_toml_is_an_error() {
    assert!(parse_stations_from_toml_str("[[station]]\nname = 3").is_err());
}

#[test]
fn station_files_round_trip_through_disk() {
    let dir = std::env::temp_dir().join(format!("airwave-stations-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let toml_path = dir.join("stations.toml");
    let mut toml_body = String::new();
    for s in builtin_stations() {
        toml_body.push_str(&format!(
            "[[station]]\nname = \"{}\"\nurl = \"{}\"\n\n",
            s.name, s.url
        ));
    }
    std::fs::write(&toml_path, toml_body).unwrap();
    assert_eq!(load_stations_from_toml(&toml_path).unwrap(), builtin_stations());

    let m3u_path = dir.join("radios.m3u");
    std::fs::write(
        &m3u_path,
        "#EXTM3U\n#EXTINF:-1,Hot 96\nhttps://hot96-atunwadigital.streamguys1.com/hot96\n",
    )
    .unwrap();
    let m3u = load_stations_from_m3u(&m3u_path).unwrap();
    assert_eq!(m3u.len(), 1);
    assert_eq!(m3u[0].name, "Hot 96");

    let _ = std::fs::remove_dir_all(&dir);
}
