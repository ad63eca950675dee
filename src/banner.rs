pub const BANNER: &str = r"
     _             _
  __| | _____   __| |_ _ __ __ _  ___ ___
 / _` |/ __\ \ / /| __| '__/ _` |/ __/ _ \
| (_| | (__ \ V / | |_| | | (_| | (_|  __/
 \__,_|\___| \_/   \__|_|  \__,_|\___\___|
";
